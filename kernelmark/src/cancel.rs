// Copyright (c) The kernelmark Authors.
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use km_util::*;

/// Cancels the paired tokens when `cancel()` is called or when dropped.
pub struct Canceller {
    term_tx: Option<Sender<()>>,
}

/// Observes cancellation. Program termination (SIGINT/TERM) also counts.
#[derive(Clone)]
pub struct CancelToken {
    term_rx: Receiver<()>,
}

pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (term_tx, term_rx) = channel::bounded::<()>(0);
    (
        Canceller {
            term_tx: Some(term_tx),
        },
        CancelToken { term_rx },
    )
}

impl Canceller {
    pub fn cancel(&mut self) {
        self.term_tx.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.term_tx.is_none()
    }
}

impl CancelToken {
    const POLL_INTV: Duration = Duration::from_millis(250);

    /// A token which is only cancelled by program termination.
    pub fn never() -> Self {
        Self {
            term_rx: channel::never(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.term_rx.try_recv() {
            Err(TryRecvError::Disconnected) => true,
            _ => prog_exiting(),
        }
    }

    /// Sleep for `dur` or until cancelled. Returns whether cancelled.
    pub fn wait(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if prog_exiting() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.term_rx.recv_timeout((deadline - now).min(Self::POLL_INTV)) {
                Err(RecvTimeoutError::Disconnected) => return true,
                _ => {}
            }
        }
    }
}
