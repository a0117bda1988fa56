// Copyright (c) The kernelmark Authors.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmError {
    #[error("kernel {kernel} failed to build ({reason})")]
    BuildFailure { kernel: String, reason: String },
    #[error("kernel {kernel} failed to deploy ({reason})")]
    DeployFailure { kernel: String, reason: String },
    #[error("{machine} didn't respond after {attempts} probes on kernel {kernel}")]
    BootUnreachable {
        machine: String,
        kernel: String,
        attempts: u32,
    },
    #[error("benchmark {run} failed ({reason})")]
    BenchmarkRunFailure { run: String, reason: String },
    #[error("failed to parse {file} ({reason})")]
    ParseFailure { file: String, reason: String },
    #[error("{nr_fails} consecutive build failures, last was {kernel}")]
    ConsecutiveFailureLimitExceeded { nr_fails: u32, kernel: String },
    #[error("cancelled")]
    Cancelled,
}

impl KmError {
    /// Whether the error terminates the whole run rather than a single
    /// kernel or sample.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DeployFailure { .. } | Self::ConsecutiveFailureLimitExceeded { .. } => true,
            _ => false,
        }
    }
}
