// Copyright (c) The kernelmark Authors.
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use super::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    Timeout,
    Cancelled,
    Signaled(i32),
}

impl Outcome {
    pub fn success(&self) -> bool {
        *self == Outcome::Exited(0)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Exited(code) => format!("exit code {}", code),
            Self::Timeout => "timed out".into(),
            Self::Cancelled => "cancelled".into(),
            Self::Signaled(sig) => format!("killed by signal {}", sig),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub outcome: Outcome,
    pub stdout_path: Option<PathBuf>,
}

/// One external command. All build, deploy and benchmark commands go
/// through `invoke()` so that timeout and cancellation behave the same.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub args: &'a [String],
    pub cwd: Option<&'a Path>,
    pub stdout: Option<&'a Path>,
    pub timeout: Duration,
}

const POLL_INTV: Duration = Duration::from_millis(100);

fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // The child leads its own process group, take down everything it forked.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub fn invoke(inv: &Invocation, cancel: &CancelToken) -> Result<ToolResult> {
    if inv.args.is_empty() {
        bail!("empty command");
    }

    let mut cmd = Command::new(&inv.args[0]);
    cmd.args(&inv.args[1..]).process_group(0).stdin(Stdio::null());
    if let Some(cwd) = inv.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(path) = inv.stdout {
        let f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening {:?}", path))?;
        cmd.stdout(f);
    }

    debug!("tool: Running {:?} timeout={:?}", inv.args, inv.timeout);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {:?}", &inv.args[0]))?;

    let started_at = Instant::now();
    let outcome = loop {
        match child.try_wait() {
            Ok(Some(status)) => match (status.code(), status.signal()) {
                (Some(code), _) => break Outcome::Exited(code),
                (None, Some(sig)) => break Outcome::Signaled(sig),
                (None, None) => break Outcome::Exited(-1),
            },
            Ok(None) => {}
            Err(e) => {
                kill_group(&mut child);
                bail!("waiting for {:?} ({})", &inv.args[0], &e);
            }
        }

        if started_at.elapsed() >= inv.timeout {
            warn!(
                "tool: {:?} timed out after {:?}, killing",
                &inv.args[0], inv.timeout
            );
            kill_group(&mut child);
            break Outcome::Timeout;
        }
        if cancel.wait(POLL_INTV) {
            debug!("tool: {:?} cancelled, killing", &inv.args[0]);
            kill_group(&mut child);
            break Outcome::Cancelled;
        }
    };

    debug!("tool: {:?} finished ({})", &inv.args[0], outcome.describe());
    Ok(ToolResult {
        outcome,
        stdout_path: inv.stdout.map(PathBuf::from),
    })
}
