// Copyright (c) The kernelmark Authors.
use anyhow::{bail, Result};
use scan_fmt::scan_fmt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Iperf3,
    Ipbench,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Iperf3 => "iperf3",
            Self::Ipbench => "ipbench",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Unidir,
    Bidir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingRole {
    Single,
    Multi,
}

impl ThreadingRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "st",
            Self::Multi => "mt",
        }
    }
}

/// Single client/server pair or one of the per-core clients of a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Threading {
    Single,
    Multi(u32),
}

impl Threading {
    pub fn role(&self) -> ThreadingRole {
        match self {
            Self::Single => ThreadingRole::Single,
            Self::Multi(_) => ThreadingRole::Multi,
        }
    }

    pub fn core(&self) -> Option<u32> {
        match self {
            Self::Single => None,
            Self::Multi(core) => Some(*core),
        }
    }
}

/// Name of one raw benchmark output file in the result store:
///
///   {tool}-{role}-{protocol}[.bidir]-{bandwidth}m-{packet_size}.test
///
/// where role is "st" or "mt{core}". Everything the aggregator knows about
/// a run's dimensions comes from here, so both writing and reading must go
/// through `Display` and `FromStr` below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResultName {
    pub tool: Tool,
    pub threading: Threading,
    pub protocol: Protocol,
    pub direction: Direction,
    pub bandwidth: u32,
    pub packet_size: u32,
}

impl ResultName {
    pub const VERSION: u32 = 1;
    pub const DELIM: char = '-';
    pub const SUFFIX: &'static str = ".test";
    pub const BIDIR_SUFFIX: &'static str = ".bidir";

    pub fn is_result_file(fname: &str) -> bool {
        fname.ends_with(Self::SUFFIX)
    }

    fn decode_tool(field: &str) -> Result<Tool> {
        Ok(match field {
            "iperf3" => Tool::Iperf3,
            "ipbench" => Tool::Ipbench,
            v => bail!("unknown tool {:?}", v),
        })
    }

    fn decode_threading(field: &str) -> Result<Threading> {
        if field == "st" {
            return Ok(Threading::Single);
        }
        match scan_fmt!(field, "mt{d}", u32) {
            Ok(core) => Ok(Threading::Multi(core)),
            Err(_) => bail!("invalid threading role {:?}", field),
        }
    }

    fn decode_protocol(field: &str) -> Result<(Protocol, Direction)> {
        let (proto, dir) = match field.strip_suffix(Self::BIDIR_SUFFIX) {
            Some(v) => (v, Direction::Bidir),
            None => (field, Direction::Unidir),
        };
        let proto = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            v => bail!("unknown protocol {:?}", v),
        };
        Ok((proto, dir))
    }

    fn decode_bandwidth(field: &str) -> Result<u32> {
        match scan_fmt!(field, "{d}m", u32) {
            Ok(v) => Ok(v),
            Err(_) => bail!("invalid bandwidth {:?}", field),
        }
    }
}

impl fmt::Display for ResultName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let d = Self::DELIM;
        write!(f, "{}{}", self.tool.name(), d)?;
        match self.threading {
            Threading::Single => write!(f, "st{}", d)?,
            Threading::Multi(core) => write!(f, "mt{}{}", core, d)?,
        }
        write!(f, "{}", self.protocol.name())?;
        if self.direction == Direction::Bidir {
            write!(f, "{}", Self::BIDIR_SUFFIX)?;
        }
        write!(
            f,
            "{}{}m{}{}{}",
            d,
            self.bandwidth,
            d,
            self.packet_size,
            Self::SUFFIX
        )
    }
}

impl FromStr for ResultName {
    type Err = anyhow::Error;

    fn from_str(fname: &str) -> Result<Self> {
        let stem = match fname.strip_suffix(Self::SUFFIX) {
            Some(v) => v,
            None => bail!("{:?} doesn't end with {:?}", fname, Self::SUFFIX),
        };

        let fields: Vec<&str> = stem.split(Self::DELIM).collect();
        if fields.len() != 5 {
            bail!("{:?} has {} fields, expected 5", fname, fields.len());
        }

        let (protocol, direction) = Self::decode_protocol(fields[2])?;
        let name = Self {
            tool: Self::decode_tool(fields[0])?,
            threading: Self::decode_threading(fields[1])?,
            protocol,
            direction,
            bandwidth: Self::decode_bandwidth(fields[3])?,
            packet_size: match fields[4].parse::<u32>() {
                Ok(v) => v,
                Err(_) => bail!("invalid packet size {:?}", fields[4]),
            },
        };

        // Reject non-canonical spellings such as "mt01" or "+1024" so that
        // every file maps back to exactly one name.
        if name.to_string() != fname {
            bail!("{:?} is not in canonical form ({:?})", fname, name.to_string());
        }
        Ok(name)
    }
}

/// Aggregation key grouping results which can be compared against each
/// other, e.g. "iperf3/tcp" or "iperf3/udp.bidir".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Series {
    pub tool: Tool,
    pub protocol: Protocol,
    pub direction: Direction,
}

impl Series {
    pub fn of(name: &ResultName) -> Self {
        Self {
            tool: name.tool,
            protocol: name.protocol,
            direction: name.direction,
        }
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.tool.name(), self.protocol.name())?;
        if self.direction == Direction::Bidir {
            write!(f, "{}", ResultName::BIDIR_SUFFIX)?;
        }
        Ok(())
    }
}

impl FromStr for Series {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let (tool, proto) = match input.split_once('/') {
            Some(v) => v,
            None => bail!("invalid series {:?}", input),
        };
        let (protocol, direction) = ResultName::decode_protocol(proto)?;
        Ok(Self {
            tool: ResultName::decode_tool(tool)?,
            protocol,
            direction,
        })
    }
}

impl Serialize for Series {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Series {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One concrete benchmark invocation against one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub kernel: String,
    pub tool: Tool,
    pub protocol: Protocol,
    pub direction: Direction,
    pub threading: Threading,
    pub bandwidth: u32,
    pub packet_size: u32,
}

impl RunSpec {
    pub fn result_name(&self) -> ResultName {
        ResultName {
            tool: self.tool,
            threading: self.threading,
            protocol: self.protocol,
            direction: self.direction,
            bandwidth: self.bandwidth,
            packet_size: self.packet_size,
        }
    }

    /// Whether `other` belongs to the same multi-core fan-out as `self`.
    pub fn same_fanout(&self, other: &RunSpec) -> bool {
        self.threading.role() == ThreadingRole::Multi
            && other.threading.role() == ThreadingRole::Multi
            && self.kernel == other.kernel
            && self.tool == other.tool
            && self.protocol == other.protocol
            && self.direction == other.direction
            && self.bandwidth == other.bandwidth
            && self.packet_size == other.packet_size
    }
}

impl fmt::Display for RunSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kernel, self.result_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_name_decode() {
        let name: ResultName = "iperf3-mt3-udp.bidir-250m-512.test".parse().unwrap();
        assert_eq!(
            name,
            ResultName {
                tool: Tool::Iperf3,
                threading: Threading::Multi(3),
                protocol: Protocol::Udp,
                direction: Direction::Bidir,
                bandwidth: 250,
                packet_size: 512,
            }
        );

        let name: ResultName = "ipbench-st-udp-1000m-90.test".parse().unwrap();
        assert_eq!(name.tool, Tool::Ipbench);
        assert_eq!(name.threading, Threading::Single);
        assert_eq!(name.direction, Direction::Unidir);
    }

    #[test]
    fn test_result_name_encode() {
        let spec = RunSpec {
            kernel: "5.19.17".into(),
            tool: Tool::Iperf3,
            protocol: Protocol::Tcp,
            direction: Direction::Unidir,
            threading: Threading::Single,
            bandwidth: 1000,
            packet_size: 1448,
        };
        assert_eq!(
            spec.result_name().to_string(),
            "iperf3-st-tcp-1000m-1448.test"
        );
        assert_eq!(spec.to_string(), "5.19.17:iperf3-st-tcp-1000m-1448.test");

        let decoded: ResultName = spec.result_name().to_string().parse().unwrap();
        assert_eq!(decoded, spec.result_name());
    }

    #[test]
    fn test_result_name_reject() {
        for bad in &[
            "iperf3-st-tcp-1000m-1448",
            "iperf3-st-tcp-1000m-1448.log",
            "iperf3-st-tcp-1000-1448.test",
            "iperf3-xt-tcp-1000m-1448.test",
            "iperf3-mt-tcp-1000m-1448.test",
            "iperf3-mt01-tcp-1000m-1448.test",
            "iperf3-st-sctp-1000m-1448.test",
            "iperf3-st-tcp.bidir.bidir-1000m-1448.test",
            "netperf-st-tcp-1000m-1448.test",
            "iperf3-st-tcp-1000m-1448-x.test",
            "iperf3-st-tcp-1000m-big.test",
            "rootfs.cpio",
        ] {
            assert!(bad.parse::<ResultName>().is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn test_series() {
        let name: ResultName = "iperf3-mt0-udp.bidir-250m-512.test".parse().unwrap();
        let series = Series::of(&name);
        assert_eq!(series.to_string(), "iperf3/udp.bidir");
        assert_eq!("iperf3/udp.bidir".parse::<Series>().unwrap(), series);
        assert_eq!(
            serde_json::to_string(&series).unwrap(),
            "\"iperf3/udp.bidir\""
        );
        assert_eq!(
            serde_json::from_str::<Series>("\"ipbench/udp\"").unwrap().tool,
            Tool::Ipbench
        );
        assert!("iperf3-udp".parse::<Series>().is_err());
        assert!("iperf3/sctp".parse::<Series>().is_err());
    }

    #[test]
    fn test_same_fanout() {
        let mut a = RunSpec {
            kernel: "6.1.1".into(),
            tool: Tool::Iperf3,
            protocol: Protocol::Udp,
            direction: Direction::Unidir,
            threading: Threading::Multi(0),
            bandwidth: 1000,
            packet_size: 512,
        };
        let mut b = a.clone();
        b.threading = Threading::Multi(1);
        assert!(a.same_fanout(&b));

        b.packet_size = 256;
        assert!(!a.same_fanout(&b));

        a.threading = Threading::Single;
        b.packet_size = 512;
        assert!(!a.same_fanout(&b));
    }
}
