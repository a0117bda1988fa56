// Copyright (c) The kernelmark Authors.
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use super::cancel::{cancel_pair, CancelToken, Canceller};
use super::error::KmError;
use super::matrix::fanout_groups;
use super::store::{ResultStore, TestMarker};
use super::tool::{self, Invocation, Outcome};
use kernelmark_intf::{Config, Protocol, ResultName, RunSpec, TargetDescriptor, Tool};
use km_util::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub nr_runs: usize,
    pub nr_failed: usize,
}

/// Handle of a benchmark sweep running on its own thread. Dropping the
/// handle cancels the sweep and waits for it.
pub struct TestRunner {
    kernel: String,
    canceller: Canceller,
    jh: Option<JoinHandle<Result<SweepSummary, KmError>>>,
}

impl TestRunner {
    pub fn spawn<F>(kernel: &str, body: F) -> Self
    where
        F: FnOnce(CancelToken) -> Result<SweepSummary, KmError> + Send + 'static,
    {
        let (canceller, token) = cancel_pair();
        Self {
            kernel: kernel.to_string(),
            canceller,
            jh: Some(spawn(move || body(token))),
        }
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn cancel(&mut self) {
        if !self.canceller.is_cancelled() {
            info!("tester: Cancelling the runner for {}", &self.kernel);
            self.canceller.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        match self.jh.as_ref() {
            Some(jh) => jh.is_finished(),
            None => true,
        }
    }

    pub fn join(mut self) -> Result<SweepSummary, KmError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<SweepSummary, KmError> {
        match self.jh.take() {
            Some(jh) => match jh.join() {
                Ok(res) => res,
                Err(_) => Err(KmError::BenchmarkRunFailure {
                    run: self.kernel.clone(),
                    reason: "test runner panicked".into(),
                }),
            },
            None => Err(KmError::Cancelled),
        }
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        if self.jh.is_some() {
            self.cancel();
            let _ = self.join_inner();
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootWait {
    pub addr: SocketAddr,
    pub probe: Vec<u8>,
    pub retries: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Probe the target's readiness port until anything comes back. Returns the
/// number of probes it took.
pub fn wait_for_boot(bw: &BootWait, machine: &str, kernel: &str, token: &CancelToken) -> Result<u32, KmError> {
    let unreachable_err = |attempts| KmError::BootUnreachable {
        machine: machine.to_string(),
        kernel: kernel.to_string(),
        attempts,
    };

    let local: SocketAddr = match bw.addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let sock = match UdpSocket::bind(local) {
        Ok(v) => v,
        Err(e) => {
            warn!("tester: Failed to bind UDP socket ({})", &e);
            return Err(unreachable_err(0));
        }
    };
    if let Err(e) = sock.set_read_timeout(Some(bw.timeout)) {
        warn!("tester: Failed to set socket timeout ({})", &e);
        return Err(unreachable_err(0));
    }

    let mut buf = [0u8; 1024];
    for attempt in 1..=bw.retries {
        if token.is_cancelled() {
            return Err(KmError::Cancelled);
        }

        let res = sock
            .send_to(&bw.probe, bw.addr)
            .and_then(|_| sock.recv_from(&mut buf));
        match res {
            Ok((len, from)) => {
                debug!(
                    "tester: {} replied {:?} on attempt {}",
                    from,
                    String::from_utf8_lossy(&buf[..len]),
                    attempt
                );
                return Ok(attempt);
            }
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    debug!("tester: No reply from {} ({}/{})", bw.addr, attempt, bw.retries)
                }
                _ => debug!("tester: Probing {} failed ({})", bw.addr, &e),
            },
        }

        if attempt < bw.retries && token.wait(bw.interval) {
            return Err(KmError::Cancelled);
        }
    }
    Err(unreachable_err(bw.retries))
}

/// Everything a sweep needs, owned so that it can move to the runner thread.
#[derive(Clone)]
pub struct Sweep {
    pub cfg: Arc<Config>,
    pub target: Arc<TargetDescriptor>,
    pub store: ResultStore,
    pub kernel: String,
    pub specs: Vec<RunSpec>,
    pub local: bool,
    pub run_log: RunLog,
}

impl Sweep {
    fn helper(&self, idx: usize) -> Option<&str> {
        if self.local || self.cfg.helpers.is_empty() {
            None
        } else {
            Some(&self.cfg.helpers[idx % self.cfg.helpers.len()])
        }
    }

    fn iperf3_args(&self, target: &str, spec: &RunSpec, port: u16, bandwidth: u32) -> Vec<String> {
        let cfg = &self.cfg;
        let mut args: Vec<String> = vec![
            cfg.iperf3_bin.clone(),
            "-c".into(),
            target.into(),
            "-p".into(),
            port.to_string(),
            "-i".into(),
            cfg.bench_report_interval.to_string(),
            "-t".into(),
            cfg.bench_duration.to_string(),
            "-J".into(),
            "--connect-timeout".into(),
            cfg.bench_connect_timeout.to_string(),
            "-b".into(),
            format!("{}M", bandwidth),
        ];
        match spec.protocol {
            Protocol::Udp => {
                args.push("-u".into());
                args.push("--length".into());
                args.push(spec.packet_size.to_string());
            }
            Protocol::Tcp => {
                args.push("--set-mss".into());
                args.push(spec.packet_size.to_string());
            }
        }
        if spec.direction == kernelmark_intf::Direction::Bidir {
            args.push("--bidir".into());
        }
        args
    }

    fn ipbench_args(&self, target: &str, spec: &RunSpec, helper: Option<&str>) -> Vec<String> {
        let mut vars = BTreeMap::new();
        vars.insert("client", helper.unwrap_or("localhost").to_string());
        vars.insert("target", target.to_string());
        vars.insert("port", self.cfg.bench_port.to_string());
        vars.insert("bps", (spec.bandwidth as u64 * 1_000_000).to_string());
        vars.insert("size", spec.packet_size.to_string());
        vars.insert("duration", self.cfg.bench_duration.to_string());
        expand_template(&self.cfg.ipbench_cmd, &vars)
    }

    /// Full command line for one client. Clients run on a helper through the
    /// remote shell unless running locally.
    pub fn client_args(&self, target: &str, spec: &RunSpec, nr_clients: u32) -> Vec<String> {
        let idx = spec.threading.core().unwrap_or(0);
        let helper = self.helper(idx as usize);
        let cmd = match spec.tool {
            Tool::Iperf3 => {
                let port = match spec.threading.core() {
                    Some(core) => self.cfg.bench_port + 1 + core as u16,
                    None => self.cfg.bench_port,
                };
                let bandwidth = (spec.bandwidth / nr_clients.max(1)).max(1);
                self.iperf3_args(target, spec, port, bandwidth)
            }
            // ipbench drives its own clients
            Tool::Ipbench => return self.ipbench_args(target, spec, helper),
        };
        match helper {
            Some(host) => {
                let mut args = self.cfg.remote_shell.clone();
                args.push(host.to_string());
                args.extend(cmd);
                args
            }
            None => cmd,
        }
    }

    /// Run one client. A failed run leaves nothing behind while a cancelled
    /// one keeps its partial output.
    fn run_client(
        path: PathBuf,
        args: Vec<String>,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<(), KmError> {
        let run = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if path.exists() {
            let _ = fs::remove_file(&path);
        }

        let res = tool::invoke(
            &Invocation {
                args: &args,
                cwd: None,
                stdout: Some(&path),
                timeout,
            },
            token,
        );
        let reason = match res {
            Ok(res) if res.outcome.success() => return Ok(()),
            Ok(res) if res.outcome == Outcome::Cancelled => return Err(KmError::Cancelled),
            Ok(res) => res.outcome.describe(),
            Err(e) => format!("{:#}", &e),
        };
        let _ = fs::remove_file(&path);
        Err(KmError::BenchmarkRunFailure { run, reason })
    }

    fn run_group(&self, target: &str, group: &[RunSpec], token: &CancelToken) -> Result<usize, KmError> {
        let timeout = secs_to_duration(self.cfg.bench_timeout);
        let nr_clients = group.len() as u32;

        let mut jhs = vec![];
        for spec in group.iter() {
            let path = self.store.result_path(&self.target.name, spec);
            let args = self.client_args(target, spec, nr_clients);
            let token = token.clone();
            info!("tester: Running {}", spec.result_name());
            jhs.push(spawn(move || Self::run_client(path, args, timeout, &token)));
        }

        let mut nr_failed = 0;
        let mut cancelled = false;
        for (spec, jh) in group.iter().zip(jhs.into_iter()) {
            let err = match jh.join() {
                Ok(Ok(())) => continue,
                Ok(Err(KmError::Cancelled)) => {
                    cancelled = true;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => KmError::BenchmarkRunFailure {
                    run: spec.result_name().to_string(),
                    reason: "client thread panicked".into(),
                },
            };
            warn!("tester: {}", &err);
            self.run_log.log(&format!("{}: {}", &self.kernel, &err));
            nr_failed += 1;
        }
        if cancelled || token.wait(secs_to_duration(self.cfg.settle_delay)) {
            return Err(KmError::Cancelled);
        }
        Ok(nr_failed)
    }

    pub fn run(self, token: CancelToken) -> Result<SweepSummary, KmError> {
        let cfg = self.cfg.clone();
        let machine = self.target.name.clone();
        let addr = self.target.address().map_err(|e| {
            warn!("tester: {:#}", &e);
            KmError::BootUnreachable {
                machine: machine.clone(),
                kernel: self.kernel.clone(),
                attempts: 0,
            }
        })?;

        info!("tester: Waiting for {} to boot {}", &machine, &self.kernel);
        let bw = BootWait {
            addr: SocketAddr::new(addr, cfg.boot_port),
            probe: cfg.boot_probe.as_bytes().to_vec(),
            retries: cfg.boot_retries,
            interval: secs_to_duration(cfg.boot_interval),
            timeout: secs_to_duration(cfg.boot_timeout),
        };
        wait_for_boot(&bw, &machine, &self.kernel, &token)?;
        info!("tester: {} is up, warming up for {}s", &machine, cfg.warmup);
        if token.wait(secs_to_duration(cfg.warmup)) {
            return Err(KmError::Cancelled);
        }

        let started_at = unix_now();
        let target = addr.to_string();
        let mut sum = SweepSummary::default();
        for group in fanout_groups(&self.specs) {
            if token.is_cancelled() {
                return Err(KmError::Cancelled);
            }
            sum.nr_failed += self.run_group(&target, group, &token)?;
            sum.nr_runs += group.len();
        }

        let marker = TestMarker {
            machine: machine.clone(),
            kernel: self.kernel.clone(),
            nr_cores: self.target.logical_cpus,
            name_version: ResultName::VERSION,
            started_at,
            ended_at: unix_now(),
            nr_runs: sum.nr_runs,
            nr_failed: sum.nr_failed,
        };
        if let Err(e) = self.store.write_marker(&marker) {
            warn!("tester: Failed to write test marker ({:#})", &e);
        }

        info!(
            "tester: Finished {} on {}, {}/{} runs succeeded",
            &self.kernel,
            &machine,
            sum.nr_runs - sum.nr_failed,
            sum.nr_runs
        );
        Ok(sum)
    }
}
