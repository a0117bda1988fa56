// Copyright (c) The kernelmark Authors.
use anyhow::{bail, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use km_util::*;

lazy_static::lazy_static! {
    static ref TOP_ARGS_STR: String = format!(
        "-c, --config=[FILE] 'Configuration file, created with defaults if missing (dfl: {dfl_cfg})'
         -v...               'Sets the level of verbosity'",
        dfl_cfg = Args::DFL_CONFIG,
    );
}

const RUN_AFTER_HELP: &str = "\
FLAGS:
    hardclean       Wipe the whole output directory first
    clean           Wipe this machine's output directory first
    buildonly       Build kernels without deploying or testing them
    skipdone        Skip kernels which are already built and tested
    local           Run benchmark clients on this host instead of the helpers
    ipbench         ipbench packet-size sweep
    iperf-bw        iperf3 bandwidth sweep
    iperf-pktsize   iperf3 packet-size sweep
    iperf           Both iperf3 sweeps
    unidir          Unidirectional runs
    bidir           Bidirectional runs, implies unidir
    bibidir         Same as bidir

Without any test selector, all tests run unidirectionally.
";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mode {
    Run,
    Aggregate,
}

/// Free-form run flags, e.g. "kernelmark run odroidc4 kernels.json clean iperf".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    pub hardclean: bool,
    pub clean: bool,
    pub buildonly: bool,
    pub skipdone: bool,
    pub local: bool,
    pub ipbench: bool,
    pub iperf_bw: bool,
    pub iperf_pktsize: bool,
    pub unidir: bool,
    pub bidir: bool,
}

impl RunFlags {
    /// Unknown flags are warned about and ignored.
    pub fn parse<'a, I: IntoIterator<Item = &'a str>>(flags: I) -> Self {
        let mut rf = Self::default();
        for flag in flags {
            match flag {
                "hardclean" => rf.hardclean = true,
                "clean" => rf.clean = true,
                "buildonly" => rf.buildonly = true,
                "skipdone" => rf.skipdone = true,
                "local" => rf.local = true,
                "ipbench" => rf.ipbench = true,
                "iperf-bw" => rf.iperf_bw = true,
                "iperf-pktsize" => rf.iperf_pktsize = true,
                "iperf" => {
                    rf.iperf_bw = true;
                    rf.iperf_pktsize = true;
                }
                "unidir" => rf.unidir = true,
                "bidir" | "bibidir" => rf.bidir = true,
                v => warn!("args: Unknown flag {:?}, ignoring", v),
            }
        }
        rf.normalize();
        rf
    }

    fn normalize(&mut self) {
        if !self.ipbench && !self.iperf_bw && !self.iperf_pktsize {
            self.ipbench = true;
            self.iperf_bw = true;
            self.iperf_pktsize = true;
        }
        // Unidirectional results are the baseline for every comparison.
        self.unidir = true;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub mode: Mode,
    pub config: String,
    pub machine: String,
    pub kernels: String,
    pub flags: RunFlags,
    pub output: Option<String>,
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: Mode::Run,
            config: Self::DFL_CONFIG.into(),
            machine: "".into(),
            kernels: "".into(),
            flags: Default::default(),
            output: None,
            verbosity: 0,
        }
    }
}

impl Args {
    pub const DFL_CONFIG: &'static str = "../conf/kernelmark.json";

    fn app() -> clap::App<'static, 'static> {
        clap::App::new("kernelmark")
            .version(*super::VERSION)
            .author("The kernelmark Authors")
            .about("Kernel build, deploy and network benchmark automation")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .setting(clap::AppSettings::SubcommandRequiredElseHelp)
            .args_from_usage(&TOP_ARGS_STR)
            .subcommand(
                clap::SubCommand::with_name("run")
                    .about("Builds, deploys and benchmarks the listed kernels")
                    .arg(
                        clap::Arg::with_name("MACHINE")
                            .required(true)
                            .help("Target machine name in the manifest"),
                    )
                    .arg(
                        clap::Arg::with_name("KERNELS")
                            .required(true)
                            .help("Kernel list json file"),
                    )
                    .arg(
                        clap::Arg::with_name("FLAG")
                            .multiple(true)
                            .help("Run flags, see below"),
                    )
                    .after_help(RUN_AFTER_HELP),
            )
            .subcommand(
                clap::SubCommand::with_name("aggregate")
                    .about("Aggregates the stored results of a machine")
                    .arg(
                        clap::Arg::with_name("MACHINE")
                            .required(true)
                            .help("Target machine name"),
                    )
                    .arg(
                        clap::Arg::with_name("output")
                            .long("output")
                            .short("o")
                            .takes_value(true)
                            .help("Aggregated result json file (dfl: OUTPUT_DIR/MACHINE.json)"),
                    ),
            )
    }

    #[cfg(test)]
    fn from_cmdline(argv: &[&str]) -> Result<Self> {
        let matches = Self::app().get_matches_from_safe(argv.iter().copied())?;
        let mut args = Self::default();
        args.process_cmdline(&matches)?;
        Ok(args)
    }
}

impl CmdlineArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        Self::app().get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(v) = matches.value_of("config") {
            self.config = if v.len() > 0 {
                v.to_string()
            } else {
                Self::DFL_CONFIG.into()
            };
        }
        self.verbosity = Self::verbosity(matches);

        match matches.subcommand() {
            ("run", Some(subm)) => {
                self.mode = Mode::Run;
                self.machine = subm.value_of("MACHINE").unwrap_or("").into();
                self.kernels = subm.value_of("KERNELS").unwrap_or("").into();
                self.flags = RunFlags::parse(subm.values_of("FLAG").into_iter().flatten());
            }
            ("aggregate", Some(subm)) => {
                self.mode = Mode::Aggregate;
                self.machine = subm.value_of("MACHINE").unwrap_or("").into();
                self.output = subm.value_of("output").map(|v| v.to_string());
            }
            (cmd, _) => bail!("unknown subcommand {:?}", cmd),
        }

        if self.machine.len() == 0 {
            bail!("{:?} requires a machine name", &self.mode);
        }
        Ok(())
    }
}
