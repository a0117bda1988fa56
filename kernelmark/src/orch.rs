// Copyright (c) The kernelmark Authors.
use console::style;
use log::{debug, info, warn};
use std::fmt;

use super::error::KmError;
use super::stages::{StageOutcome, Stages};
use super::store::Artifacts;
use super::tester::TestRunner;
use kernelmark_intf::{KernelEntry, KernelList, RunFlags};
use km_util::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Pending,
    Building,
    BuildRetry,
    Built,
    BuildFailed,
    Deploying,
    Deployed,
    DeployFailed,
    Testing,
    Tested,
    Skipped,
    Done,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::BuildRetry => "build-retry",
            Self::Built => "built",
            Self::BuildFailed => "build-failed",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::DeployFailed => "deploy-failed",
            Self::Testing => "testing",
            Self::Tested => "tested",
            Self::Skipped => "skipped",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub nr_kernels: usize,
    pub attempted: usize,
    pub built: usize,
    pub build_failed: usize,
    pub deployed: usize,
    pub tested: usize,
    pub test_failed: usize,
    pub skipped: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Kernels: {} attempted out of {}, {} skipped",
            self.attempted, self.nr_kernels, self.skipped
        )?;
        writeln!(
            f,
            "Builds: {} succeeded, {} failed",
            self.built, self.build_failed
        )?;
        write!(
            f,
            "Tests: {} deployed, {} tested, {} test phases failed",
            self.deployed, self.tested, self.test_failed
        )
    }
}

/// State of one orchestration run. Kernels are processed strictly in order.
/// The test runner of the last deployed kernel is kept here so that it can
/// be cancelled on a fatal failure and is joined before the next deploy.
pub struct OrchCtx<S: Stages> {
    stages: S,
    fail_threshold: u32,
    buildonly: bool,
    skipdone: bool,
    nr_fails: u32,
    runner: Option<TestRunner>,
    run_log: RunLog,
    sum: RunSummary,
}

impl<S: Stages> OrchCtx<S> {
    pub fn new(stages: S, fail_threshold: u32, flags: &RunFlags, run_log: RunLog) -> Self {
        Self {
            stages,
            fail_threshold,
            buildonly: flags.buildonly,
            skipdone: flags.skipdone,
            nr_fails: 0,
            runner: None,
            run_log,
            sum: Default::default(),
        }
    }

    pub fn stages(&self) -> &S {
        &self.stages
    }

    pub fn summary(&self) -> &RunSummary {
        &self.sum
    }

    fn transition(&mut self, kernel: &str, state: KernelState) {
        debug!("orch: {} -> {}", kernel, state);
        self.run_log.log(&format!("{}: {}", kernel, state));
    }

    fn alert(&mut self, msg: &str) {
        println!("{}", style(msg).red().bold());
        self.run_log.log(&format!("ALERT: {}", msg));
    }

    fn cancel_runner(&mut self) {
        if let Some(mut runner) = self.runner.take() {
            runner.cancel();
            let kernel = runner.kernel().to_string();
            let _ = runner.join();
            self.run_log.log(&format!("{}: test runner cancelled", &kernel));
        }
    }

    fn join_runner(&mut self) {
        let runner = match self.runner.take() {
            Some(v) => v,
            None => return,
        };
        let kernel = runner.kernel().to_string();
        if !runner.is_finished() {
            info!("orch: Waiting for the test runner of {}", &kernel);
        }
        match runner.join() {
            Ok(sum) => {
                self.sum.tested += 1;
                self.transition(&kernel, KernelState::Tested);
                self.run_log.log(&format!(
                    "{}: {}/{} benchmark runs succeeded",
                    &kernel,
                    sum.nr_runs - sum.nr_failed,
                    sum.nr_runs
                ));
            }
            Err(KmError::Cancelled) => {
                self.run_log.log(&format!("{}: test runner cancelled", &kernel));
            }
            Err(e) => {
                self.sum.test_failed += 1;
                self.alert(&format!("Test phase of {} aborted: {}", &kernel, &e));
            }
        }
        self.transition(&kernel, KernelState::Done);
    }

    /// Build `ent` unless reusable artifacts exist. Returns the artifacts on
    /// success and `None` if the kernel failed to build. An interrupted build
    /// is neither retried nor counted as a failure.
    fn build_kernel(&mut self, ent: &KernelEntry) -> Result<Option<Artifacts>, KmError> {
        let kernel = ent.version;

        if let Some(arts) = self.stages.existing_artifacts(kernel) {
            info!("orch: {} already built, reusing", kernel);
            self.nr_fails = 0;
            self.sum.built += 1;
            self.transition(kernel, KernelState::Built);
            return Ok(Some(arts));
        }

        self.transition(kernel, KernelState::Building);
        let mut res = self.stages.build(ent, ent.first_of_major);
        if let StageOutcome::Failure(reason) = &res.outcome {
            self.alert(&format!(
                "Kernel {} failed to build ({}), retrying with clean",
                kernel, reason
            ));
            self.transition(kernel, KernelState::BuildRetry);
            self.transition(kernel, KernelState::Building);
            res = self.stages.build(ent, true);
        }

        match (res.outcome, res.artifacts) {
            (StageOutcome::Success, Some(arts)) => {
                self.nr_fails = 0;
                self.sum.built += 1;
                self.transition(kernel, KernelState::Built);
                Ok(Some(arts))
            }
            (StageOutcome::Cancelled, _) => {
                self.run_log.log(&format!("{}: build interrupted", kernel));
                Err(KmError::Cancelled)
            }
            (outcome, _) => {
                let reason = match outcome {
                    StageOutcome::Failure(reason) => reason,
                    _ => "no artifacts".into(),
                };
                self.nr_fails += 1;
                self.sum.build_failed += 1;
                let err = KmError::BuildFailure {
                    kernel: kernel.to_string(),
                    reason,
                };
                self.alert(&format!(
                    "{}, skipping ({}/{} consecutive failures)",
                    &err, self.nr_fails, self.fail_threshold
                ));
                self.transition(kernel, KernelState::BuildFailed);
                Ok(None)
            }
        }
    }

    fn run_kernel(&mut self, ent: &KernelEntry) -> Result<(), KmError> {
        let kernel = ent.version;
        self.sum.attempted += 1;
        self.transition(kernel, KernelState::Pending);

        if self.skipdone
            && self.stages.existing_artifacts(kernel).is_some()
            && self.stages.is_tested(kernel)
        {
            info!("orch: {} already tested, skipping", kernel);
            self.sum.skipped += 1;
            self.transition(kernel, KernelState::Skipped);
            self.transition(kernel, KernelState::Done);
            return Ok(());
        }

        let arts = match self.build_kernel(ent)? {
            Some(v) => v,
            None => return Ok(()),
        };
        if self.buildonly {
            self.transition(kernel, KernelState::Done);
            return Ok(());
        }

        // The target is about to be reused.
        self.join_runner();

        self.runner = Some(self.stages.start_tester(kernel));
        self.transition(kernel, KernelState::Deploying);
        let res = self.stages.deploy(kernel, &arts);
        match res.outcome {
            StageOutcome::Success => {
                self.sum.deployed += 1;
                self.transition(kernel, KernelState::Deployed);
                self.transition(kernel, KernelState::Testing);
                Ok(())
            }
            StageOutcome::Cancelled => {
                self.cancel_runner();
                Err(KmError::Cancelled)
            }
            StageOutcome::Failure(reason) => {
                self.transition(kernel, KernelState::DeployFailed);
                self.cancel_runner();
                Err(KmError::DeployFailure {
                    kernel: kernel.to_string(),
                    reason,
                })
            }
        }
    }

    fn run_kernels(&mut self, kernels: &KernelList) -> Result<(), KmError> {
        for ent in kernels.iter() {
            if prog_exiting() {
                warn!("orch: Exiting, {} not attempted", ent.version);
                return Err(KmError::Cancelled);
            }
            if self.nr_fails >= self.fail_threshold {
                return Err(KmError::ConsecutiveFailureLimitExceeded {
                    nr_fails: self.nr_fails,
                    kernel: ent.version.to_string(),
                });
            }
            self.run_kernel(&ent)?;
        }
        Ok(())
    }

    /// Take every kernel of `kernels` through build, deploy and test. Only
    /// fatal failures end the run early.
    pub fn run(&mut self, kernels: &KernelList) -> Result<RunSummary, KmError> {
        self.sum.nr_kernels = kernels.nr_kernels();
        self.run_log
            .log(&format!("starting run over {} kernels", self.sum.nr_kernels));

        let res = self.run_kernels(kernels);
        match &res {
            Ok(()) => self.join_runner(),
            Err(e) if e.is_fatal() => {
                self.alert(&format!("Aborting: {}", e));
                self.cancel_runner();
            }
            Err(e) => {
                warn!("orch: Stopping ({})", e);
                self.run_log.log(&format!("stopping: {}", e));
                self.cancel_runner();
            }
        }
        self.stages.release();

        self.run_log.log(&format!(
            "run finished, {}/{} kernels built",
            self.sum.built, self.sum.attempted
        ));
        res.map(|_| self.sum.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::stages::{BuildResult, DeployResult};
    use super::super::tester::SweepSummary;
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct MockStages {
        /// kernel -> number of build attempts which fail
        fail_builds: HashMap<String, u32>,
        /// Kernels whose build is interrupted by program exit
        interrupt_builds: HashSet<String>,
        fail_deploy: HashSet<String>,
        /// Kernels whose runner only finishes when cancelled
        slow: HashSet<String>,
        /// Kernels which never answer the boot probe
        unreachable: HashSet<String>,
        existing: HashSet<String>,
        tested: HashSet<String>,

        builds: Vec<(String, bool)>,
        deploys: Vec<String>,
        testers: Vec<String>,
        nr_released: usize,
        cancelled: Arc<AtomicBool>,
    }

    fn arts(kernel: &str) -> Artifacts {
        Artifacts {
            image: PathBuf::from(format!("/out/{}/Image", kernel)),
            rootfs: PathBuf::from(format!("/out/{}/rootfs.cpio", kernel)),
        }
    }

    impl Stages for MockStages {
        fn existing_artifacts(&self, kernel: &str) -> Option<Artifacts> {
            if self.existing.contains(kernel) {
                Some(arts(kernel))
            } else {
                None
            }
        }

        fn is_tested(&self, kernel: &str) -> bool {
            self.tested.contains(kernel)
        }

        fn build(&mut self, ent: &KernelEntry, clean: bool) -> BuildResult {
            self.builds.push((ent.version.to_string(), clean));
            if self.interrupt_builds.contains(ent.version) {
                return BuildResult {
                    kernel: ent.version.into(),
                    outcome: StageOutcome::Cancelled,
                    artifacts: None,
                };
            }
            let fail = match self.fail_builds.get_mut(ent.version) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            BuildResult {
                kernel: ent.version.into(),
                outcome: if fail {
                    StageOutcome::Failure("make exited 2".into())
                } else {
                    StageOutcome::Success
                },
                artifacts: if fail { None } else { Some(arts(ent.version)) },
            }
        }

        fn start_tester(&mut self, kernel: &str) -> TestRunner {
            self.testers.push(kernel.into());
            let slow = self.slow.contains(kernel);
            let unreachable = self.unreachable.contains(kernel);
            let cancelled = self.cancelled.clone();
            let kernel_copy = kernel.to_string();
            TestRunner::spawn(kernel, move |token| {
                if unreachable {
                    return Err(KmError::BootUnreachable {
                        machine: "odroidc4".into(),
                        kernel: kernel_copy,
                        attempts: 20,
                    });
                }
                if !slow {
                    return Ok(SweepSummary { nr_runs: 3, nr_failed: 0 });
                }
                if token.wait(Duration::from_secs(60)) {
                    cancelled.store(true, Ordering::Relaxed);
                    Err(KmError::Cancelled)
                } else {
                    Ok(Default::default())
                }
            })
        }

        fn deploy(&mut self, kernel: &str, _arts: &Artifacts) -> DeployResult {
            self.deploys.push(kernel.into());
            DeployResult {
                kernel: kernel.into(),
                outcome: if self.fail_deploy.contains(kernel) {
                    StageOutcome::Failure("mq.sh exited 1".into())
                } else {
                    StageOutcome::Success
                },
            }
        }

        fn release(&mut self) {
            self.nr_released += 1;
        }
    }

    fn kernels(majors: &[(&str, &[&str])]) -> KernelList {
        KernelList {
            majors: majors
                .iter()
                .map(|(m, vers)| (m.to_string(), vers.iter().map(|v| v.to_string()).collect()))
                .collect(),
        }
    }

    fn numbered(nr: usize) -> KernelList {
        let vers: Vec<String> = (1..=nr).map(|i| format!("k{}", i)).collect();
        KernelList {
            majors: vec![("k".into(), vers)],
        }
    }

    fn flags(args: &[&str]) -> RunFlags {
        RunFlags::parse(args.iter().copied())
    }

    fn ctx(stages: MockStages, args: &[&str]) -> OrchCtx<MockStages> {
        let _ = env_logger::try_init();
        OrchCtx::new(stages, 8, &flags(args), RunLog::disabled())
    }

    #[test]
    fn test_failure_limit() {
        let mut stages = MockStages::default();
        for i in 1..=10 {
            stages.fail_builds.insert(format!("k{}", i), 2);
        }
        let mut ctx = ctx(stages, &[]);
        match ctx.run(&numbered(10)) {
            Err(KmError::ConsecutiveFailureLimitExceeded { nr_fails, kernel }) => {
                assert_eq!(nr_fails, 8);
                assert_eq!(kernel, "k9");
            }
            v => panic!("unexpected {:?}", v),
        }
        let sum = ctx.summary();
        assert_eq!(sum.attempted, 8);
        assert_eq!(sum.build_failed, 8);
        assert_eq!(ctx.stages().builds.len(), 16);
        assert!(ctx.stages().builds.iter().all(|(k, _)| k != "k9"));
        assert!(ctx.stages().deploys.is_empty());
        assert_eq!(ctx.stages().nr_released, 1);
    }

    #[test]
    fn test_failure_reset() {
        let mut stages = MockStages::default();
        for i in 1..=7 {
            stages.fail_builds.insert(format!("k{}", i), 2);
        }
        for i in 9..=15 {
            stages.fail_builds.insert(format!("k{}", i), 2);
        }
        let mut ctx = ctx(stages, &["buildonly"]);
        let sum = ctx.run(&numbered(15)).unwrap();
        assert_eq!(sum.attempted, 15);
        assert_eq!(sum.built, 1);
        assert_eq!(sum.build_failed, 14);
        assert!(ctx.stages().builds.iter().any(|(k, _)| k == "k9"));
        assert!(ctx.stages().deploys.is_empty());
        assert!(ctx.stages().testers.is_empty());
    }

    #[test]
    fn test_fatal_deploy() {
        let mut stages = MockStages::default();
        stages.fail_deploy.insert("6.0.2".into());
        stages.slow.insert("6.0.2".into());
        let cancelled = stages.cancelled.clone();

        let mut ctx = ctx(stages, &[]);
        let res = ctx.run(&kernels(&[("6.x", &["6.0.1", "6.0.2", "6.0.3"])]));
        match res {
            Err(KmError::DeployFailure { kernel, .. }) => assert_eq!(kernel, "6.0.2"),
            v => panic!("unexpected {:?}", v),
        }
        assert!(cancelled.load(Ordering::Relaxed));

        let stages = ctx.stages();
        assert_eq!(stages.deploys, vec!["6.0.1", "6.0.2"]);
        assert_eq!(stages.testers, vec!["6.0.1", "6.0.2"]);
        assert!(stages.builds.iter().all(|(k, _)| k != "6.0.3"));
        assert_eq!(stages.nr_released, 1);

        let sum = ctx.summary();
        assert_eq!(sum.attempted, 2);
        assert_eq!(sum.deployed, 1);
        assert_eq!(sum.tested, 1);
    }

    #[test]
    fn test_clean_policy() {
        let mut stages = MockStages::default();
        stages.fail_builds.insert("5.19.17".into(), 1);
        let mut ctx = ctx(stages, &["buildonly"]);
        let sum = ctx
            .run(&kernels(&[
                ("5.x", &["5.19.16", "5.19.17"]),
                ("6.x", &["6.0.1", "6.0.2"]),
            ]))
            .unwrap();
        assert_eq!(sum.built, 4);
        assert_eq!(sum.build_failed, 0);

        let builds: Vec<(&str, bool)> = ctx
            .stages()
            .builds
            .iter()
            .map(|(k, c)| (k.as_str(), *c))
            .collect();
        assert_eq!(
            builds,
            vec![
                ("5.19.16", true),
                ("5.19.17", false),
                ("5.19.17", true),
                ("6.0.1", true),
                ("6.0.2", false),
            ]
        );
    }

    #[test]
    fn test_skipdone_and_reuse() {
        let mut stages = MockStages::default();
        stages.existing.insert("6.0.1".into());
        stages.tested.insert("6.0.1".into());
        stages.existing.insert("6.0.2".into());
        stages.tested.insert("6.0.3".into());

        let mut ctx = ctx(stages, &["skipdone"]);
        let sum = ctx
            .run(&kernels(&[("6.x", &["6.0.1", "6.0.2", "6.0.3"])]))
            .unwrap();
        assert_eq!(sum.skipped, 1);
        assert_eq!(sum.built, 2);
        assert_eq!(sum.deployed, 2);
        assert_eq!(sum.tested, 2);

        let stages = ctx.stages();
        // 6.0.2 reuses its artifacts, 6.0.3 has a marker but nothing to deploy.
        assert_eq!(stages.builds, vec![("6.0.3".to_string(), false)]);
        assert_eq!(stages.deploys, vec!["6.0.2", "6.0.3"]);
    }

    #[test]
    fn test_build_interrupted() {
        let mut stages = MockStages::default();
        stages.interrupt_builds.insert("6.0.1".into());
        let mut ctx = ctx(stages, &[]);
        let res = ctx.run(&kernels(&[("6.x", &["6.0.1", "6.0.2"])]));
        assert!(matches!(res, Err(KmError::Cancelled)));

        // No clean retry and nothing counted against the kernel.
        assert_eq!(ctx.stages().builds, vec![("6.0.1".to_string(), true)]);
        assert!(ctx.stages().deploys.is_empty());
        assert_eq!(ctx.stages().nr_released, 1);
        let sum = ctx.summary();
        assert_eq!(sum.attempted, 1);
        assert_eq!(sum.built, 0);
        assert_eq!(sum.build_failed, 0);
        assert_eq!(ctx.nr_fails, 0);
    }

    #[test]
    fn test_boot_unreachable() {
        let mut stages = MockStages::default();
        stages.unreachable.insert("6.0.1".into());
        stages.unreachable.insert("6.0.2".into());
        let mut ctx = ctx(stages, &[]);
        let sum = ctx
            .run(&kernels(&[("6.x", &["6.0.1", "6.0.2", "6.0.3"])]))
            .unwrap();

        // Only the test phase of the unreachable kernels is lost.
        let stages = ctx.stages();
        assert_eq!(stages.deploys, vec!["6.0.1", "6.0.2", "6.0.3"]);
        assert_eq!(stages.testers, vec!["6.0.1", "6.0.2", "6.0.3"]);
        assert_eq!(sum.built, 3);
        assert_eq!(sum.deployed, 3);
        assert_eq!(sum.test_failed, 2);
        assert_eq!(sum.tested, 1);
        assert_eq!(ctx.nr_fails, 0);
    }

    #[test]
    fn test_summary_format() {
        let sum = RunSummary {
            nr_kernels: 10,
            attempted: 9,
            built: 7,
            build_failed: 2,
            deployed: 7,
            tested: 6,
            test_failed: 1,
            skipped: 0,
        };
        let text = format!("{}", &sum);
        assert!(text.contains("9 attempted out of 10"));
        assert!(text.contains("7 succeeded, 2 failed"));
    }
}
