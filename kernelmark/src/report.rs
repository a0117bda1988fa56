// Copyright (c) The kernelmark Authors.
use serde::Deserialize;

use super::error::KmError;
use kernelmark_intf::{Direction, Protocol, ResultName, Tool};

const MBPS: f64 = 1_000_000.0;

/// Measured fields of one benchmark output. Throughputs are in Mbit/s, RTT
/// in microseconds and CPU in percent.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub throughput_sent: f64,
    pub throughput_received: Option<f64>,
    pub mean_rtt: Option<f64>,
    pub cpu_utilization: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Iperf3Sum {
    bits_per_second: f64,
}

#[derive(Debug, Deserialize)]
struct Iperf3StreamSender {
    mean_rtt: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Iperf3Stream {
    sender: Option<Iperf3StreamSender>,
}

#[derive(Debug, Deserialize)]
struct Iperf3Cpu {
    host_total: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Iperf3End {
    sum_sent: Option<Iperf3Sum>,
    sum: Option<Iperf3Sum>,
    sum_sent_bidir_reverse: Option<Iperf3Sum>,
    sum_bidir_reverse: Option<Iperf3Sum>,
    streams: Vec<Iperf3Stream>,
    cpu_utilization_percent: Option<Iperf3Cpu>,
}

#[derive(Debug, Deserialize)]
struct Iperf3TestStart {
    protocol: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Iperf3Start {
    test_start: Option<Iperf3TestStart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Iperf3Report {
    start: Iperf3Start,
    intervals: Vec<serde_json::Value>,
    end: Iperf3End,
    error: Option<String>,
}

fn parse_iperf3(name: &ResultName, body: &str) -> Result<Measurement, String> {
    let rep: Iperf3Report = serde_json::from_str(body).map_err(|e| format!("{}", &e))?;

    if rep.intervals.is_empty() {
        return Err(match rep.error {
            Some(err) => format!("zero recorded intervals ({})", err),
            None => "zero recorded intervals".into(),
        });
    }

    if let Some(ts) = rep.start.test_start.as_ref() {
        if !ts.protocol.eq_ignore_ascii_case(name.protocol.name()) {
            return Err(format!(
                "body protocol {:?} doesn't match {:?}",
                &ts.protocol,
                name.protocol.name()
            ));
        }
    }

    let end = &rep.end;
    let sent = match end.sum_sent.as_ref().or(end.sum.as_ref()) {
        Some(v) => v.bits_per_second / MBPS,
        None => return Err("no sent throughput".into()),
    };

    let received = match name.direction {
        Direction::Bidir => match end
            .sum_sent_bidir_reverse
            .as_ref()
            .or(end.sum_bidir_reverse.as_ref())
        {
            Some(v) => Some(v.bits_per_second / MBPS),
            None => return Err("no reverse throughput on a bidirectional run".into()),
        },
        Direction::Unidir => None,
    };

    let mean_rtt = match name.protocol {
        Protocol::Tcp => end
            .streams
            .first()
            .and_then(|s| s.sender.as_ref())
            .and_then(|s| s.mean_rtt),
        Protocol::Udp => None,
    };

    Ok(Measurement {
        throughput_sent: sent,
        throughput_received: received,
        mean_rtt,
        cpu_utilization: end.cpu_utilization_percent.as_ref().map(|c| c.host_total),
    })
}

/// ipbench latency test output, one row per reporting client:
///
///   Requested_throughput,Achieved_throughput_sent,Achieved_throughput_received,
///   Sent_size,Min,Avg,Max,Std-dev,Median[,Cpu]
///
/// Throughputs are in bit/s. The optional trailing column is the target CPU
/// utilization reported by the cpu_target plugin. Header and "[unmarshall]"
/// lines are skipped.
fn parse_ipbench(body: &str) -> Result<Measurement, String> {
    const NR_COLS: usize = 9;
    let mut sent = vec![];
    let mut cpu = vec![];

    for (lineno, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.contains("[unmarshall]") {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields[0].parse::<f64>().is_err() {
            continue;
        }
        if fields.len() < NR_COLS {
            return Err(format!("line {} has {} columns", lineno + 1, fields.len()));
        }
        let mut vals = vec![];
        for f in fields.iter() {
            match f.parse::<f64>() {
                Ok(v) => vals.push(v),
                Err(_) => return Err(format!("line {} has invalid value {:?}", lineno + 1, f)),
            }
        }
        sent.push(vals[1] / MBPS);
        if vals.len() > NR_COLS {
            cpu.push(vals[NR_COLS]);
        }
    }

    if sent.is_empty() {
        return Err("zero recorded intervals".into());
    }

    Ok(Measurement {
        throughput_sent: statistical::mean(&sent),
        throughput_received: None,
        mean_rtt: None,
        cpu_utilization: if cpu.is_empty() {
            None
        } else {
            Some(statistical::mean(&cpu))
        },
    })
}

/// Parse the body of result file `file` whose dimensions are `name`.
pub fn parse_report(file: &str, name: &ResultName, body: &str) -> Result<Measurement, KmError> {
    let res = match name.tool {
        Tool::Iperf3 => parse_iperf3(name, body),
        Tool::Ipbench => parse_ipbench(body),
    };
    res.map_err(|reason| KmError::ParseFailure {
        file: file.to_string(),
        reason,
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn iperf3_body(proto: &str, bidir: bool, nr_intervals: usize, mbps: f64, rtt: f64, cpu: f64) -> String {
        let intervals: Vec<serde_json::Value> = (0..nr_intervals)
            .map(|_| serde_json::json!({"sum": {"bits_per_second": mbps * MBPS}}))
            .collect();
        let mut end = serde_json::json!({
            "sum_sent": {"bits_per_second": mbps * MBPS},
            "streams": [{"sender": {"mean_rtt": rtt}}],
            "cpu_utilization_percent": {"host_total": cpu, "remote_total": 1.0},
        });
        if bidir {
            end["sum_sent_bidir_reverse"] = serde_json::json!({"bits_per_second": mbps * MBPS / 2.0});
        }
        serde_json::to_string_pretty(&serde_json::json!({
            "start": {"test_start": {"protocol": proto, "num_streams": 1}},
            "intervals": intervals,
            "end": end,
        }))
        .unwrap()
    }

    fn name(s: &str) -> ResultName {
        s.parse().unwrap()
    }

    #[test]
    fn test_iperf3() {
        let n = name("iperf3-st-tcp.bidir-1000m-1024.test");
        let m = parse_report("f", &n, &iperf3_body("TCP", true, 2, 940.0, 350.0, 12.5)).unwrap();
        assert_eq!(
            m,
            Measurement {
                throughput_sent: 940.0,
                throughput_received: Some(470.0),
                mean_rtt: Some(350.0),
                cpu_utilization: Some(12.5),
            }
        );

        let n = name("iperf3-st-udp-100m-512.test");
        let m = parse_report("f", &n, &iperf3_body("UDP", false, 1, 99.0, 0.0, 3.0)).unwrap();
        assert_eq!(m.throughput_received, None);
        assert_eq!(m.mean_rtt, None);
    }

    #[test]
    fn test_iperf3_failures() {
        let n = name("iperf3-st-tcp-1000m-1024.test");

        let zero = parse_report("f", &n, &iperf3_body("TCP", false, 0, 940.0, 350.0, 12.5));
        match zero {
            Err(KmError::ParseFailure { reason, .. }) => assert!(reason.contains("zero")),
            v => panic!("unexpected {:?}", v),
        }

        let failed = r#"{"start": {}, "intervals": [], "end": {}, "error": "unable to connect to server"}"#;
        assert!(parse_report("f", &n, failed).is_err());

        assert!(parse_report("f", &n, &iperf3_body("UDP", false, 2, 940.0, 350.0, 12.5)).is_err());
        assert!(parse_report("f", &n, "").is_err());
        assert!(parse_report("f", &n, "{\"intervals\": [{}], \"end\": {}}").is_err());

        let n = name("iperf3-st-tcp.bidir-1000m-1024.test");
        assert!(parse_report("f", &n, &iperf3_body("TCP", false, 2, 940.0, 350.0, 12.5)).is_err());
    }

    #[test]
    fn test_ipbench() {
        let n = name("ipbench-st-udp-1000m-512.test");
        let body = "\
[unmarshall] 2 clients\n\
Requested_throughput,Achieved_throughput_sent,Achieved_throughput_received,Sent_size,Min,Avg,Max,Std-dev,Median,Cpu\n\
1000000000,900000000,890000000,512,40,55,90,5,54,30\n\
1000000000,800000000,790000000,512,41,56,91,6,55,50\n";
        let m = parse_report("f", &n, body).unwrap();
        assert_eq!(m.throughput_sent, 850.0);
        assert_eq!(m.cpu_utilization, Some(40.0));
        assert_eq!(m.mean_rtt, None);

        let m = parse_report("f", &n, "1000000000,900000000,890000000,512,40,55,90,5,54\n").unwrap();
        assert_eq!(m.cpu_utilization, None);

        assert!(parse_report("f", &n, "[unmarshall] nothing\n").is_err());
        assert!(parse_report("f", &n, "1000000000,900000000\n").is_err());
        assert!(parse_report("f", &n, "1000000000,9x,1,1,1,1,1,1,1\n").is_err());
    }
}
