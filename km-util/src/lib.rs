// Copyright (c) The kernelmark Authors.
use anyhow::Result;
use log::info;
use simplelog as sl;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};

pub mod json_file;
pub mod run_log;

pub use json_file::{JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};
pub use run_log::RunLog;

pub fn custom_underline(content: &str, line_char: &str) -> String {
    let nr_spaces = content.chars().take_while(|c| *c == ' ').count();
    let len = content.chars().count() - nr_spaces;
    format!(
        "{}\n{}{}\n",
        content,
        " ".repeat(nr_spaces),
        line_char.repeat(len)
    )
}

pub fn underline(content: &str) -> String {
    custom_underline(content, "-")
}

pub fn double_underline(content: &str) -> String {
    custom_underline(content, "=")
}

/// Substitute `{key}` placeholders in each argument of a command template.
/// Unknown placeholders are left untouched.
pub fn expand_template(tmpl: &[String], vars: &BTreeMap<&str, String>) -> Vec<String> {
    tmpl.iter()
        .map(|arg| {
            let mut arg = arg.clone();
            for (key, val) in vars.iter() {
                let pat = format!("{{{}}}", key);
                if arg.contains(&pat) {
                    arg = arg.replace(&pat, val);
                }
            }
            arg
        })
        .collect()
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

/// Config durations are floating point seconds. Negative values mean zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 => sl::LevelFilter::Info,
            1 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

pub trait CmdlineArgs
where
    Self: Default,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<()>;

    fn init_args_and_logging() -> Result<Self> {
        let matches = Self::match_cmdline();
        init_logging(Self::verbosity(&matches));

        let mut args: Self = Default::default();
        args.process_cmdline(&matches)?;
        Ok(args)
    }
}

static PROG_EXITING: AtomicBool = AtomicBool::new(false);

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    PROG_EXITING.store(true, Ordering::Relaxed);
}

pub fn prog_exiting() -> bool {
    PROG_EXITING.load(Ordering::Relaxed)
}
