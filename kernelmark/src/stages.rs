// Copyright (c) The kernelmark Authors.
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::cancel::CancelToken;
use super::error::KmError;
use super::matrix::{self, MatrixParams};
use super::store::{find_image, Artifacts, ResultStore};
use super::tester::{Sweep, TestRunner};
use super::tool::{self, Invocation, Outcome};
use kernelmark_intf::{Config, KernelEntry, RunFlags, TargetDescriptor};
use km_util::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure(String),
    /// Interrupted by program exit. Not the kernel's fault.
    Cancelled,
}

impl StageOutcome {
    fn from_result<T>(res: &Result<T>) -> Self {
        match res {
            Ok(_) => Self::Success,
            Err(e) => match e.downcast_ref::<KmError>() {
                Some(KmError::Cancelled) => Self::Cancelled,
                _ => Self::Failure(format!("{:#}", e)),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub kernel: String,
    pub outcome: StageOutcome,
    /// Only populated on success.
    pub artifacts: Option<Artifacts>,
}

#[derive(Debug, Clone)]
pub struct DeployResult {
    pub kernel: String,
    pub outcome: StageOutcome,
}

/// The side-effecting half of the orchestration loop. The loop itself only
/// sees the results so that it can be driven by synthetic stages.
pub trait Stages {
    /// Artifacts of an earlier build of `kernel`, if complete.
    fn existing_artifacts(&self, kernel: &str) -> Option<Artifacts>;
    /// Whether a benchmark sweep of `kernel` completed earlier.
    fn is_tested(&self, kernel: &str) -> bool;
    fn build(&mut self, kernel: &KernelEntry, clean: bool) -> BuildResult;
    /// Start the benchmark sweep of `kernel` in the background. It waits
    /// for the target to come up on its own.
    fn start_tester(&mut self, kernel: &str) -> TestRunner;
    /// Blocks for the whole deployment session.
    fn deploy(&mut self, kernel: &str, artifacts: &Artifacts) -> DeployResult;
    /// Release the target reservation.
    fn release(&mut self);
}

const BUILD_LOG: &str = "build.log";
const CLEAN_LOG: &str = "clean.log";
const DEPLOY_LOG: &str = "deploy.log";
const RELEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Stages backed by the configured external commands.
pub struct RealStages {
    cfg: Arc<Config>,
    target: Arc<TargetDescriptor>,
    store: ResultStore,
    flags: RunFlags,
    run_log: RunLog,
}

impl RealStages {
    pub fn new(
        cfg: Arc<Config>,
        target: Arc<TargetDescriptor>,
        flags: &RunFlags,
        run_log: RunLog,
    ) -> Self {
        let store = ResultStore::new(&cfg.output_dir);
        Self {
            cfg,
            target,
            store,
            flags: flags.clone(),
            run_log,
        }
    }

    fn template_vars(&self, kernel: &str) -> BTreeMap<&'static str, String> {
        let mut vars = self.target.template_vars();
        vars.insert("kernel", kernel.to_string());
        vars.insert(
            "kernel_dir",
            self.store
                .kernel_dir(&self.target.name, kernel)
                .to_string_lossy()
                .to_string(),
        );
        vars.insert("build_dir", self.cfg.build_dir.clone());
        vars.insert("build_conf_dir", self.cfg.build_conf_dir.clone());
        vars
    }

    fn run_step(
        &self,
        what: &str,
        tmpl: &[String],
        vars: &BTreeMap<&'static str, String>,
        cwd: Option<&Path>,
        log_path: &Path,
        timeout: Duration,
    ) -> Result<()> {
        let args = expand_template(tmpl, vars);
        let res = tool::invoke(
            &Invocation {
                args: &args,
                cwd,
                stdout: Some(log_path),
                timeout,
            },
            &CancelToken::never(),
        )
        .with_context(|| format!("{} command", what))?;
        if res.outcome == Outcome::Cancelled {
            let err = anyhow::Error::new(KmError::Cancelled);
            return Err(err.context(format!("{} command", what)));
        }
        if !res.outcome.success() {
            match res.stdout_path.as_ref() {
                Some(path) => bail!("{} {}, see {:?}", what, res.outcome.describe(), path),
                None => bail!("{} {}", what, res.outcome.describe()),
            }
        }
        Ok(())
    }

    /// Install the machine's build config and pin the kernel version.
    fn prepare_build_config(&self, vars: &BTreeMap<&'static str, String>) -> Result<()> {
        let build_dir = Path::new(&self.cfg.build_dir);
        let dot_config = build_dir.join(".config");
        let src = Path::new(&self.cfg.build_conf_dir).join(format!("{}.config", &self.target.name));

        if src.exists() {
            fs::copy(&src, &dot_config)
                .with_context(|| format!("copying {:?} to {:?}", &src, &dot_config))?;
            debug!("stages: Installed {:?}", &src);
        } else {
            warn!("stages: {:?} not found, building with the existing config", &src);
        }

        let lines = expand_template(&self.cfg.build_config_append, vars);
        if lines.len() > 0 {
            let mut f = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&dot_config)
                .with_context(|| format!("opening {:?}", &dot_config))?;
            for line in lines.iter() {
                writeln!(f, "{}", line)?;
            }
        }
        Ok(())
    }

    fn collect_artifacts(&self, kdir: &Path) -> Result<Artifacts> {
        let images = Path::new(&self.cfg.build_dir).join(&self.cfg.build_images_subdir);
        let image_src = find_image(&images, &self.cfg.image_glob)
            .ok_or_else(|| anyhow!("no {:?} in {:?}", &self.cfg.image_glob, &images))?;
        let rootfs_src = images.join(&self.cfg.rootfs_name);

        let copy = |src: &Path| -> Result<PathBuf> {
            let dst = match src.file_name() {
                Some(name) => kdir.join(name),
                None => bail!("invalid artifact path {:?}", src),
            };
            fs::copy(src, &dst).with_context(|| format!("copying {:?}", src))?;
            Ok(dst)
        };

        Ok(Artifacts {
            image: copy(&image_src)?,
            rootfs: copy(&rootfs_src)?,
        })
    }

    fn try_build(&self, ent: &KernelEntry, clean: bool) -> Result<Artifacts> {
        let kdir = self.store.ensure_kernel_dir(&self.target.name, ent.version)?;
        let build_dir = PathBuf::from(&self.cfg.build_dir);
        let timeout = secs_to_duration(self.cfg.build_timeout);
        let mut vars = self.template_vars(ent.version);
        vars.insert("major", ent.major.to_string());

        self.prepare_build_config(&vars)?;
        if clean {
            info!("stages: Cleaning the build tree for {}", ent.version);
            self.run_step(
                "clean",
                &self.cfg.clean_cmd,
                &vars,
                Some(&build_dir),
                &kdir.join(CLEAN_LOG),
                timeout,
            )?;
        }
        info!("stages: Building {} for {}", ent.version, &self.target.name);
        self.run_step(
            "build",
            &self.cfg.build_cmd,
            &vars,
            Some(&build_dir),
            &kdir.join(BUILD_LOG),
            timeout,
        )?;
        self.collect_artifacts(&kdir)
    }

    fn try_deploy(&self, kernel: &str, arts: &Artifacts) -> Result<()> {
        let kdir = self.store.ensure_kernel_dir(&self.target.name, kernel)?;
        let mut vars = self.template_vars(kernel);
        vars.insert("image", arts.image.to_string_lossy().to_string());
        vars.insert("rootfs", arts.rootfs.to_string_lossy().to_string());

        info!("stages: Deploying {} to {}", kernel, &self.target.name);
        self.run_step(
            "deploy",
            &self.cfg.deploy_cmd,
            &vars,
            None,
            &kdir.join(DEPLOY_LOG),
            secs_to_duration(self.cfg.deploy_timeout),
        )
    }
}

impl Stages for RealStages {
    fn existing_artifacts(&self, kernel: &str) -> Option<Artifacts> {
        self.store.artifacts(
            &self.target.name,
            kernel,
            &self.cfg.image_glob,
            &self.cfg.rootfs_name,
        )
    }

    fn is_tested(&self, kernel: &str) -> bool {
        self.store.has_marker(&self.target.name, kernel)
    }

    fn build(&mut self, ent: &KernelEntry, clean: bool) -> BuildResult {
        let res = self.try_build(ent, clean);
        BuildResult {
            kernel: ent.version.to_string(),
            outcome: StageOutcome::from_result(&res),
            artifacts: res.ok(),
        }
    }

    fn start_tester(&mut self, kernel: &str) -> TestRunner {
        let params = MatrixParams::new(&self.flags, self.target.logical_cpus, self.cfg.multicore);
        let specs = matrix::generate(kernel, &params);
        info!("stages: {} benchmark runs queued for {}", specs.len(), kernel);

        let sweep = Sweep {
            cfg: self.cfg.clone(),
            target: self.target.clone(),
            store: self.store.clone(),
            kernel: kernel.to_string(),
            specs,
            local: self.flags.local,
            run_log: self.run_log.clone(),
        };
        TestRunner::spawn(kernel, move |token| sweep.run(token))
    }

    fn deploy(&mut self, kernel: &str, arts: &Artifacts) -> DeployResult {
        self.release();
        let outcome = StageOutcome::from_result(&self.try_deploy(kernel, arts));
        DeployResult {
            kernel: kernel.to_string(),
            outcome,
        }
    }

    fn release(&mut self) {
        if self.cfg.release_cmd.is_empty() {
            return;
        }
        let args = expand_template(&self.cfg.release_cmd, &self.target.template_vars());
        let res = tool::invoke(
            &Invocation {
                args: &args,
                cwd: None,
                stdout: None,
                timeout: RELEASE_TIMEOUT,
            },
            &CancelToken::never(),
        );
        match res {
            Ok(res) if res.outcome.success() => debug!("stages: Released {}", &self.target.name),
            Ok(res) if res.outcome == Outcome::Cancelled => {}
            Ok(res) => warn!("stages: Release command {}", res.outcome.describe()),
            Err(e) => warn!("stages: Release command failed ({:#})", &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelmark_intf::MachineEntry;

    struct Fixture {
        dir: tempfile::TempDir,
        cfg: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::try_init();
            let dir = tempfile::TempDir::new().unwrap();
            let path = |sub: &str| dir.path().join(sub).to_str().unwrap().to_string();
            fs::create_dir_all(path("buildroot")).unwrap();
            fs::create_dir_all(path("conf")).unwrap();
            fs::write(dir.path().join("conf/odroidc4.config"), "BR2_aarch64=y\n").unwrap();

            let mut cfg = Config::default();
            cfg.output_dir = path("output");
            cfg.build_dir = path("buildroot");
            cfg.build_conf_dir = path("conf");
            cfg.build_cmd = vec![
                "sh".into(),
                "-c".into(),
                "mkdir -p output/images && echo {kernel} > output/images/Image && \
                 echo fs > output/images/rootfs.cpio"
                    .into(),
            ];
            cfg.clean_cmd = vec!["sh".into(), "-c".into(), "touch cleaned".into()];
            cfg.release_cmd = vec![];
            Self { dir, cfg }
        }

        fn stages(&self) -> RealStages {
            let target = TargetDescriptor::new(
                "odroidc4",
                &MachineEntry {
                    isa: "aarch64".into(),
                    soc: "s905x3".into(),
                    kernel_defconfig: "odroidc4_defconfig".into(),
                    device_tree: "meson-sm1-odroid-c4".into(),
                    mac: "00:1e:06:48:6d:91".into(),
                    forward: "odroidc4".into(),
                    logical_cpus: 4,
                    ip: Some("127.0.0.1".into()),
                },
            )
            .unwrap();
            RealStages::new(
                Arc::new(self.cfg.clone()),
                Arc::new(target),
                &RunFlags::default(),
                RunLog::disabled(),
            )
        }
    }

    const ENT: KernelEntry = KernelEntry {
        major: "6.x",
        version: "6.0.1",
        first_of_major: true,
    };

    #[test]
    fn test_build() {
        let fx = Fixture::new();
        let mut stages = fx.stages();
        assert!(stages.existing_artifacts("6.0.1").is_none());

        let res = stages.build(&ENT, false);
        assert_eq!(res.outcome, StageOutcome::Success);
        let arts = res.artifacts.unwrap();
        assert_eq!(fs::read_to_string(&arts.image).unwrap().trim(), "6.0.1");
        assert!(arts.rootfs.ends_with("odroidc4/6.0.1/rootfs.cpio"));
        assert_eq!(stages.existing_artifacts("6.0.1"), Some(arts));
        assert!(!fx.dir.path().join("buildroot/cleaned").exists());

        let dot_config = fs::read_to_string(fx.dir.path().join("buildroot/.config")).unwrap();
        assert_eq!(
            dot_config,
            "BR2_aarch64=y\nBR2_LINUX_KERNEL_CUSTOM_VERSION=y\n\
             BR2_LINUX_KERNEL_CUSTOM_VERSION_VALUE=\"6.0.1\"\n"
        );

        let res = stages.build(&ENT, true);
        assert_eq!(res.outcome, StageOutcome::Success);
        assert!(fx.dir.path().join("buildroot/cleaned").exists());
        assert!(!stages.is_tested("6.0.1"));
    }

    #[test]
    fn test_build_failure() {
        let mut fx = Fixture::new();
        fx.cfg.build_cmd = vec!["sh".into(), "-c".into(), "echo broken; exit 2".into()];
        let res = fx.stages().build(&ENT, false);
        assert!(res.artifacts.is_none());
        match res.outcome {
            StageOutcome::Failure(reason) => assert!(reason.contains("exit code 2")),
            v => panic!("unexpected {:?}", v),
        }
        let log = fx.dir.path().join("output/odroidc4/6.0.1").join(BUILD_LOG);
        assert_eq!(fs::read_to_string(log).unwrap().trim(), "broken");

        // Succeeds but leaves no image behind.
        fx.cfg.build_cmd = vec!["true".into()];
        let res = fx.stages().build(&ENT, false);
        assert!(matches!(res.outcome, StageOutcome::Failure(_)));
    }

    #[test]
    fn test_cancelled_outcome() {
        let res: Result<()> = Err(anyhow::Error::new(KmError::Cancelled).context("build command"));
        assert_eq!(StageOutcome::from_result(&res), StageOutcome::Cancelled);

        let res: Result<()> = Err(anyhow!("build exit code 2"));
        assert_eq!(
            StageOutcome::from_result(&res),
            StageOutcome::Failure("build exit code 2".into())
        );
        assert_eq!(StageOutcome::from_result(&Ok(())), StageOutcome::Success);
    }

    #[test]
    fn test_deploy_and_release() {
        let mut fx = Fixture::new();
        let released = fx.dir.path().join("released");
        fx.cfg.release_cmd = vec![
            "sh".into(),
            "-c".into(),
            format!("echo {{machine}} >> {}", released.to_str().unwrap()),
        ];
        fx.cfg.deploy_cmd = vec!["echo".into(), "{machine}".into(), "{image}".into()];

        let mut stages = fx.stages();
        let arts = stages.build(&ENT, false).artifacts.unwrap();
        let res = stages.deploy("6.0.1", &arts);
        assert_eq!(res.outcome, StageOutcome::Success);
        let log = fs::read_to_string(fx.dir.path().join("output/odroidc4/6.0.1").join(DEPLOY_LOG)).unwrap();
        assert_eq!(log.trim(), format!("odroidc4 {}", arts.image.to_str().unwrap()));
        assert_eq!(fs::read_to_string(&released).unwrap(), "odroidc4\n");

        fx.cfg.deploy_cmd = vec!["false".into()];
        let mut stages = fx.stages();
        assert!(matches!(
            stages.deploy("6.0.1", &arts).outcome,
            StageOutcome::Failure(_)
        ));
        assert_eq!(fs::read_to_string(&released).unwrap(), "odroidc4\nodroidc4\n");
    }
}
