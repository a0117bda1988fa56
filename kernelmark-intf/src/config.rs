// Copyright (c) The kernelmark Authors.
use serde::{Deserialize, Serialize};
use km_util::*;

const CONFIG_DOC: &str = "\
//
// kernelmark configuration
//
// Command templates are argument vectors. \"{KEY}\" in any argument is
// replaced with the matching value, unknown keys are left alone.
//
//  {machine} {isa} {soc} {defconfig} {device_tree} {mac} {forward} {target}
//  {kernel} {major} {kernel_dir} {image} {rootfs} {build_dir} {build_conf_dir}
//
// output_dir: Result store root, {output_dir}/MACHINE/KERNEL/
// run_log: Append-only log of every state transition and failure
// manifest: Machine manifest file
// build_dir: Working directory of the build tool
// build_conf_dir: Per-machine build configs, MACHINE.config is copied to
//                 build_dir/.config before each build if present
// build_config_append[]: Lines appended to build_dir/.config after the copy,
//                        selects the kernel version to build
// build_cmd[]: Incremental build command
// clean_cmd[]: Clean command, run before build_cmd when clean is forced
// build_images_subdir: Where the build tool leaves its images, relative to
//                      build_dir
// image_glob: Glob matching the boot image in the images directory
// rootfs_name: Root filesystem image file name
// deploy_cmd[]: Deploy command, non-zero exit is fatal
// release_cmd[]: Run before each deploy and at the end, empty to disable
// build_timeout: Build command timeout in seconds
// deploy_timeout: Deploy command timeout in seconds
// bench_timeout: Timeout for a single benchmark invocation in seconds
// fail_threshold: Abort after this many consecutive failed builds
// boot_port: UDP readiness port on the target
// boot_probe: Readiness probe payload
// boot_retries: Maximum number of readiness probes
// boot_interval: Seconds between readiness probes
// boot_timeout: Seconds to wait for a reply to each probe
// warmup: Seconds to wait after the target first replied
// iperf3_bin: iperf3 client binary
// bench_duration: iperf3 test duration in seconds (-t)
// bench_report_interval: iperf3 reporting interval in seconds (-i)
// bench_connect_timeout: iperf3 connect timeout in milliseconds
// bench_port: iperf3 server port for single-threaded runs, multi-threaded
//             client N connects to bench_port + 1 + N
// settle_delay: Seconds to wait after each benchmark invocation
// multicore: Run per-core fan-out iperf3 runs on multi-core targets
// helpers[]: Load generator hosts, used unless the \"local\" flag is given
// remote_shell[]: Prefix to run a command on a helper, followed by the
//                 helper host name
// ipbench_cmd[]: ipbench command, also takes {client} {port} {bps} {size}
//                {duration}
//
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: String,
    pub run_log: String,
    pub manifest: String,

    pub build_dir: String,
    pub build_conf_dir: String,
    pub build_config_append: Vec<String>,
    pub build_cmd: Vec<String>,
    pub clean_cmd: Vec<String>,
    pub build_images_subdir: String,
    pub image_glob: String,
    pub rootfs_name: String,
    pub deploy_cmd: Vec<String>,
    pub release_cmd: Vec<String>,

    pub build_timeout: f64,
    pub deploy_timeout: f64,
    pub bench_timeout: f64,
    pub fail_threshold: u32,

    pub boot_port: u16,
    pub boot_probe: String,
    pub boot_retries: u32,
    pub boot_interval: f64,
    pub boot_timeout: f64,
    pub warmup: f64,

    pub iperf3_bin: String,
    pub bench_duration: u32,
    pub bench_report_interval: u32,
    pub bench_connect_timeout: u32,
    pub bench_port: u16,
    pub settle_delay: f64,
    pub multicore: bool,
    pub helpers: Vec<String>,
    pub remote_shell: Vec<String>,
    pub ipbench_cmd: Vec<String>,
}

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(|x| x.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: "../output".into(),
            run_log: "logfile".into(),
            manifest: "../conf/machines.json".into(),

            build_dir: "../buildroot".into(),
            build_conf_dir: "../conf/buildroot".into(),
            build_config_append: strs(&[
                "BR2_LINUX_KERNEL_CUSTOM_VERSION=y",
                "BR2_LINUX_KERNEL_CUSTOM_VERSION_VALUE=\"{kernel}\"",
            ]),
            build_cmd: strs(&["make"]),
            clean_cmd: strs(&["make", "clean"]),
            build_images_subdir: "output/images".into(),
            image_glob: "*Image".into(),
            rootfs_name: "rootfs.cpio".into(),
            deploy_cmd: strs(&[
                "mq.sh", "run", "-c", "Ostritch", "-s", "{machine}", "-L", "-d", "1200", "-f",
                "{image}", "-f", "{rootfs}",
            ]),
            release_cmd: strs(&["mq.sh", "sem", "-signal", "{machine}"]),

            build_timeout: 4.0 * 3600.0,
            deploy_timeout: 1500.0,
            bench_timeout: 120.0,
            fail_threshold: Self::DFL_FAIL_THRESHOLD,

            boot_port: 1345,
            boot_probe: "Emu".into(),
            boot_retries: 30,
            boot_interval: 5.0,
            boot_timeout: 10.0,
            warmup: 3.0,

            iperf3_bin: "iperf3".into(),
            bench_duration: 15,
            bench_report_interval: 10,
            bench_connect_timeout: 5000,
            bench_port: 5201,
            settle_delay: 3.0,
            multicore: true,
            helpers: vec![],
            remote_shell: strs(&["ssh", "-o", "BatchMode=yes"]),
            ipbench_cmd: strs(&[
                "ipbench",
                "--client={client}",
                "--test=latency",
                "--test-args=socktype=udp,bps={bps},size={size}",
                "--test-target={target}",
                "--test-port={port}",
                "--target={target}",
                "--target-test=cpu_target_lukem",
            ]),
        }
    }
}

impl Config {
    pub const DFL_FAIL_THRESHOLD: u32 = 8;
}

impl JsonLoad for Config {
    fn loaded(&mut self) -> anyhow::Result<()> {
        if self.fail_threshold == 0 {
            anyhow::bail!("fail_threshold must be positive");
        }
        if self.deploy_cmd.is_empty() || self.build_cmd.is_empty() {
            anyhow::bail!("build_cmd and deploy_cmd can't be empty");
        }
        Ok(())
    }
}

impl JsonSave for Config {
    fn preamble() -> Option<String> {
        Some(CONFIG_DOC.to_string())
    }
}
