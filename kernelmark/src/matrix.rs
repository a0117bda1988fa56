// Copyright (c) The kernelmark Authors.
use log::{debug, warn};
use std::collections::HashSet;

use kernelmark_intf::{Direction, Protocol, RunFlags, RunSpec, Threading, Tool};

pub const PKT_SIZES: [u32; 5] = [1024, 512, 256, 128, 90];
pub const BANDWIDTHS: [u32; 6] = [1000, 750, 500, 250, 100, 50];
pub const PKTSIZE_SWEEP_BW: u32 = 1000;
/// Link MTU ceiling.
pub const BW_SWEEP_PKT_SIZE: u32 = 1448;

#[derive(Debug, Clone)]
pub struct MatrixParams {
    pub ipbench: bool,
    pub iperf_bw: bool,
    pub iperf_pktsize: bool,
    pub directions: Vec<Direction>,
    pub nr_cores: u32,
    pub multicore: bool,
}

impl MatrixParams {
    pub fn new(flags: &RunFlags, nr_cores: u32, multicore: bool) -> Self {
        let mut directions = vec![];
        if flags.unidir || !flags.bidir {
            directions.push(Direction::Unidir);
        }
        if flags.bidir {
            directions.push(Direction::Bidir);
        }
        Self {
            ipbench: flags.ipbench,
            iperf_bw: flags.iperf_bw,
            iperf_pktsize: flags.iperf_pktsize,
            directions,
            nr_cores,
            multicore,
        }
    }
}

struct MatrixBuilder<'a> {
    kernel: &'a str,
    seen: HashSet<String>,
    specs: Vec<RunSpec>,
}

impl<'a> MatrixBuilder<'a> {
    fn push(
        &mut self,
        tool: Tool,
        protocol: Protocol,
        direction: Direction,
        threading: Threading,
        bandwidth: u32,
        packet_size: u32,
    ) {
        let spec = RunSpec {
            kernel: self.kernel.to_string(),
            tool,
            protocol,
            direction,
            threading,
            bandwidth,
            packet_size,
        };
        let name = spec.result_name().to_string();
        if self.seen.insert(name) {
            self.specs.push(spec);
        } else {
            warn!("matrix: Dropping duplicate {}", &spec);
        }
    }

    fn push_iperf3(&mut self, params: &MatrixParams, bandwidth: u32, packet_size: u32) {
        for protocol in [Protocol::Tcp, Protocol::Udp].iter() {
            for direction in params.directions.iter() {
                self.push(
                    Tool::Iperf3,
                    *protocol,
                    *direction,
                    Threading::Single,
                    bandwidth,
                    packet_size,
                );
                if params.multicore && params.nr_cores > 1 {
                    for core in 0..params.nr_cores {
                        self.push(
                            Tool::Iperf3,
                            *protocol,
                            *direction,
                            Threading::Multi(core),
                            bandwidth,
                            packet_size,
                        );
                    }
                }
            }
        }
    }
}

/// Expand the enabled test categories into the ordered RunSpecs for
/// `kernel`. The output only depends on the inputs.
pub fn generate(kernel: &str, params: &MatrixParams) -> Vec<RunSpec> {
    let mut mb = MatrixBuilder {
        kernel,
        seen: HashSet::new(),
        specs: vec![],
    };

    if params.ipbench {
        for size in PKT_SIZES.iter() {
            mb.push(
                Tool::Ipbench,
                Protocol::Udp,
                Direction::Unidir,
                Threading::Single,
                PKTSIZE_SWEEP_BW,
                *size,
            );
        }
    }

    if params.iperf_pktsize {
        for size in PKT_SIZES.iter() {
            mb.push_iperf3(params, PKTSIZE_SWEEP_BW, *size);
        }
    }

    if params.iperf_bw {
        for bw in BANDWIDTHS.iter() {
            mb.push_iperf3(params, *bw, BW_SWEEP_PKT_SIZE);
        }
    }

    debug!("matrix: {} runs for {}", mb.specs.len(), kernel);
    mb.specs
}

/// Split `specs` into units of execution. Every single-threaded spec is a
/// unit of its own while consecutive members of one multi-core fan-out form
/// a single unit.
pub fn fanout_groups(specs: &[RunSpec]) -> Vec<&[RunSpec]> {
    let mut groups = vec![];
    let mut start = 0;
    for idx in 1..=specs.len() {
        if idx == specs.len() || !specs[start].same_fanout(&specs[idx]) {
            groups.push(&specs[start..idx]);
            start = idx;
        }
    }
    groups
}
