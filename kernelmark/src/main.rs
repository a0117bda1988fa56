// Copyright (c) The kernelmark Authors.
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use kernelmark_intf::{Args, Config, KernelList, Manifest, Mode, FULL_VERSION};
use km_util::*;

mod aggregate;
mod cancel;
mod error;
mod matrix;
mod orch;
mod report;
mod stages;
mod store;
mod tester;
mod tool;

use aggregate::AggregatedResultSet;
use orch::OrchCtx;
use stages::RealStages;
use store::ResultStore;

fn open_run_log(cfg: &Config) -> RunLog {
    match RunLog::new(&cfg.run_log) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to open run log {:?} ({:#}), disabling", &cfg.run_log, &e);
            RunLog::disabled()
        }
    }
}

fn run(args: &Args, cfg: Config) -> Result<bool> {
    let manifest = Manifest::load(&cfg.manifest)
        .with_context(|| format!("loading manifest {:?}", &cfg.manifest))?;
    let target = manifest.target(&args.machine)?;
    let kernels = KernelList::load(&args.kernels)
        .with_context(|| format!("loading kernel list {:?}", &args.kernels))?;

    let store = ResultStore::new(&cfg.output_dir);
    if args.flags.hardclean {
        store.nuke()?;
    } else if args.flags.clean {
        store.clean(&args.machine)?;
    }

    info!(
        "Running {} kernels on {} ({}, {} cpus), results under {:?}",
        kernels.nr_kernels(),
        &target.name,
        &target.soc,
        target.logical_cpus,
        store.root()
    );

    let cfg = Arc::new(cfg);
    let run_log = open_run_log(&cfg);
    let stages = RealStages::new(cfg.clone(), Arc::new(target), &args.flags, run_log.clone());
    let mut ctx = OrchCtx::new(stages, cfg.fail_threshold, &args.flags, run_log);

    let res = ctx.run(&kernels);
    println!("{}", double_underline("Summary"));
    println!("{}", ctx.summary());
    match res {
        Ok(_) => Ok(true),
        Err(e) => {
            error!("{}", &e);
            Ok(false)
        }
    }
}

fn aggregate(args: &Args, cfg: &Config) -> Result<()> {
    let set = aggregate::aggregate(Path::new(&cfg.output_dir), &args.machine)?;

    let path = match args.output.as_ref() {
        Some(v) => PathBuf::from(v),
        None => Path::new(&cfg.output_dir).join(format!("{}.json", &args.machine)),
    };
    let mut rep = JsonReportFile::<AggregatedResultSet>::new(Some(&path));
    rep.data = set;
    rep.commit()
        .with_context(|| format!("writing {:?}", &path))?;

    // Output piped into `head` and the like may go away early.
    if let Err(e) = aggregate::format_summary(Box::new(std::io::stdout()), &rep.data) {
        if e.kind() != ErrorKind::BrokenPipe {
            return Err(e).context("printing the summary");
        }
    }
    info!(
        "Wrote {} samples to {:?}, {} files discarded",
        rep.data.nr_samples(),
        &path,
        rep.data.discarded.len()
    );
    Ok(())
}

fn main() {
    setup_prog_state();

    let args = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("Failed to process args ({:#})", &e);
        exit(1);
    });
    info!("kernelmark {}", *FULL_VERSION);

    let cfg = match JsonConfigFile::<Config>::load_or_create(Some(&args.config)) {
        Ok(v) => v.data,
        Err(e) => {
            error!("Failed to load config {:?} ({:#})", &args.config, &e);
            exit(1);
        }
    };

    match args.mode {
        Mode::Run => match run(&args, cfg) {
            Ok(true) => {}
            Ok(false) => exit(1),
            Err(e) => {
                error!("{:#}", &e);
                exit(1);
            }
        },
        Mode::Aggregate => {
            if let Err(e) = aggregate(&args, &cfg) {
                error!("Failed to aggregate results of {} ({:#})", &args.machine, &e);
                exit(1);
            }
        }
    }
}
