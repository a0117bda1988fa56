// Copyright (c) The kernelmark Authors.
use anyhow::{bail, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use super::report::{self, Measurement};
use super::store::ResultStore;
use kernelmark_intf::{
    Direction, Protocol, ResultName, Series, Threading, ThreadingRole, Tool,
};
use km_util::*;

/// One benchmark result. Dimensions come from the result file name and
/// measurements from its body. A combined multi-core sample has no `core`
/// and `nr_cores` counts the cores which contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub kernel: String,
    pub machine: String,
    pub tool: Tool,
    pub protocol: Protocol,
    pub direction: Direction,
    pub threading_role: ThreadingRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<u32>,
    pub nr_cores: u32,
    pub packet_size: u32,
    pub target_bandwidth: u32,
    pub throughput_sent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_received: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_rtt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_utilization: Option<f64>,
}

impl RawSample {
    fn new(machine: &str, kernel: &str, name: &ResultName, meas: Measurement) -> Self {
        Self {
            kernel: kernel.to_string(),
            machine: machine.to_string(),
            tool: name.tool,
            protocol: name.protocol,
            direction: name.direction,
            threading_role: name.threading.role(),
            core: name.threading.core(),
            nr_cores: 1,
            packet_size: name.packet_size,
            target_bandwidth: name.bandwidth,
            throughput_sent: meas.throughput_sent,
            throughput_received: meas.throughput_received,
            mean_rtt: meas.mean_rtt,
            cpu_utilization: meas.cpu_utilization,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingCores {
    pub kernel: String,
    pub series: Series,
    pub target_bandwidth: u32,
    pub packet_size: u32,
    pub cores: Vec<u32>,
}

/// target bandwidth -> samples ordered by packet size
pub type BandwidthMap = BTreeMap<u32, Vec<RawSample>>;
pub type SeriesMap = BTreeMap<Series, BandwidthMap>;
pub type RoleMap = BTreeMap<ThreadingRole, SeriesMap>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResultSet {
    pub machine: String,
    pub name_version: u32,
    pub kernels: BTreeMap<String, RoleMap>,
    pub discarded: Vec<DiscardedFile>,
    pub missing_cores: Vec<MissingCores>,
}

impl JsonLoad for AggregatedResultSet {}
impl JsonSave for AggregatedResultSet {}

impl AggregatedResultSet {
    pub fn nr_samples(&self) -> usize {
        self.kernels
            .values()
            .flat_map(|roles| roles.values())
            .flat_map(|series| series.values())
            .flat_map(|bws| bws.values())
            .map(|samples| samples.len())
            .sum()
    }

    fn push(&mut self, sample: RawSample) {
        let series = Series {
            tool: sample.tool,
            protocol: sample.protocol,
            direction: sample.direction,
        };
        self.kernels
            .entry(sample.kernel.clone())
            .or_default()
            .entry(sample.threading_role)
            .or_default()
            .entry(series)
            .or_default()
            .entry(sample.target_bandwidth)
            .or_default()
            .push(sample);
    }

    fn discard(&mut self, path: &Path, reason: String) {
        warn!("aggregate: Discarding {:?} ({})", path, &reason);
        self.discarded.push(DiscardedFile {
            path: path.to_string_lossy().to_string(),
            reason,
        });
    }
}

/// Per-core samples of one (series, bandwidth) fan-out group of a kernel:
/// packet size -> core -> sample
type FanoutGroup = BTreeMap<u32, BTreeMap<u32, RawSample>>;

fn mean_of(vals: &[f64]) -> Option<f64> {
    if vals.is_empty() {
        None
    } else {
        Some(statistical::mean(vals))
    }
}

/// Sum throughputs and average latency and CPU over the cores present.
fn combine_cores(per_core: &BTreeMap<u32, RawSample>) -> Option<RawSample> {
    let first = per_core.values().next()?;
    let samples: Vec<&RawSample> = per_core.values().collect();

    let sent: f64 = samples.iter().map(|s| s.throughput_sent).sum();
    let received: Vec<f64> = samples.iter().filter_map(|s| s.throughput_received).collect();
    let rtts: Vec<f64> = samples.iter().filter_map(|s| s.mean_rtt).collect();
    let cpus: Vec<f64> = samples.iter().filter_map(|s| s.cpu_utilization).collect();

    Some(RawSample {
        core: None,
        nr_cores: samples.len() as u32,
        throughput_sent: sent,
        throughput_received: if received.is_empty() {
            None
        } else {
            Some(received.iter().sum())
        },
        mean_rtt: mean_of(&rtts),
        cpu_utilization: mean_of(&cpus),
        ..first.clone()
    })
}

fn combine_fanouts(
    set: &mut AggregatedResultSet,
    kernel: &str,
    groups: BTreeMap<(Series, u32), FanoutGroup>,
    marker_cores: Option<u32>,
) {
    for ((series, bw), group) in groups.into_iter() {
        let mut expected: BTreeSet<u32> = group
            .values()
            .flat_map(|per_core| per_core.keys().cloned())
            .collect();
        if let Some(nr) = marker_cores {
            expected.extend(0..nr);
        }

        for (size, per_core) in group.iter() {
            let missing: Vec<u32> = expected
                .iter()
                .filter(|core| !per_core.contains_key(core))
                .cloned()
                .collect();
            if missing.len() > 0 {
                warn!(
                    "aggregate: {} {} {}m/{}: cores {:?} missing, excluded from the combined sample",
                    kernel, &series, bw, size, &missing
                );
                set.missing_cores.push(MissingCores {
                    kernel: kernel.to_string(),
                    series,
                    target_bandwidth: bw,
                    packet_size: *size,
                    cores: missing,
                });
            }
            if let Some(combined) = combine_cores(per_core) {
                set.push(combined);
            }
        }
    }
}

fn aggregate_kernel(set: &mut AggregatedResultSet, store: &ResultStore, machine: &str, kernel: &str) -> Result<()> {
    let marker_cores = store.load_marker(machine, kernel).map(|m| m.nr_cores);
    let mut fanouts = BTreeMap::<(Series, u32), FanoutGroup>::new();

    for fname in store.list_results(machine, kernel)?.iter() {
        let path = store.kernel_dir(machine, kernel).join(fname);

        let name = match fname.parse::<ResultName>() {
            Ok(v) => v,
            Err(e) => {
                set.discard(&path, format!("{:#}", &e));
                continue;
            }
        };
        let body = match fs::read_to_string(&path) {
            Ok(v) => v,
            Err(e) => {
                set.discard(&path, format!("{}", &e));
                continue;
            }
        };
        let meas = match report::parse_report(fname, &name, &body) {
            Ok(v) => v,
            Err(e) => {
                set.discard(&path, format!("{}", &e));
                continue;
            }
        };

        let sample = RawSample::new(machine, kernel, &name, meas);
        match name.threading {
            Threading::Single => set.push(sample),
            Threading::Multi(core) => {
                fanouts
                    .entry((Series::of(&name), name.bandwidth))
                    .or_default()
                    .entry(name.packet_size)
                    .or_default()
                    .insert(core, sample);
            }
        }
    }

    combine_fanouts(set, kernel, fanouts, marker_cores);
    Ok(())
}

/// Rebuild the aggregated view of `machine` from the result store. Only
/// reads from the store and can be repeated at any time.
pub fn aggregate(root: &Path, machine: &str) -> Result<AggregatedResultSet> {
    let store = ResultStore::new(root);
    if !store.machine_dir(machine).is_dir() {
        bail!("no results for {:?} under {:?}", machine, root);
    }

    let mut set = AggregatedResultSet {
        machine: machine.to_string(),
        name_version: ResultName::VERSION,
        ..Default::default()
    };

    for kernel in store.list_kernels(machine)?.iter() {
        aggregate_kernel(&mut set, &store, machine, kernel)?;
    }

    for roles in set.kernels.values_mut() {
        for series in roles.values_mut() {
            for bws in series.values_mut() {
                for samples in bws.values_mut() {
                    samples.sort_by_key(|s| s.packet_size);
                }
            }
        }
    }

    debug!(
        "aggregate: {} samples from {} kernels, {} discarded",
        set.nr_samples(),
        set.kernels.len(),
        set.discarded.len()
    );
    Ok(set)
}

fn format_opt(v: Option<f64>, prec: usize) -> String {
    match v {
        Some(v) => format!("{:.*}", prec, v),
        None => "-".into(),
    }
}

pub fn format_summary<'a>(mut out: Box<dyn Write + 'a>, set: &AggregatedResultSet) -> io::Result<()> {
    writeln!(
        out,
        "{}",
        double_underline(&format!("Aggregated results: {}", &set.machine))
    )?;

    for (kernel, roles) in set.kernels.iter() {
        writeln!(out, "{}", underline(&format!("Kernel {}", kernel)))?;
        for (role, series_map) in roles.iter() {
            for (series, bws) in series_map.iter() {
                for (bw, samples) in bws.iter() {
                    writeln!(out, "[{} {} {}m]", role.name(), series, bw)?;
                    writeln!(
                        out,
                        "  {:>5}  {:>9}  {:>9}  {:>9}  {:>6}  {:>5}",
                        "size", "sent", "recv", "rtt(us)", "cpu%", "cores"
                    )?;
                    for s in samples.iter() {
                        writeln!(
                            out,
                            "  {:>5}  {:>9.2}  {:>9}  {:>9}  {:>6}  {:>5}",
                            s.packet_size,
                            s.throughput_sent,
                            format_opt(s.throughput_received, 2),
                            format_opt(s.mean_rtt, 1),
                            format_opt(s.cpu_utilization, 1),
                            s.nr_cores
                        )?;
                    }
                }
            }
        }
        writeln!(out, "")?;
    }

    if set.missing_cores.len() > 0 {
        writeln!(out, "Incomplete fan-outs:")?;
        for mc in set.missing_cores.iter() {
            writeln!(
                out,
                "  {} {} {}m/{} missing cores {:?}",
                &mc.kernel, &mc.series, mc.target_bandwidth, mc.packet_size, &mc.cores
            )?;
        }
    }
    if set.discarded.len() > 0 {
        writeln!(out, "Discarded files:")?;
        for d in set.discarded.iter() {
            writeln!(out, "  {} ({})", &d.path, &d.reason)?;
        }
    }
    Ok(())
}
