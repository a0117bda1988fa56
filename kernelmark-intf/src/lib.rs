// Copyright (c) The kernelmark Authors.
pub mod args;
pub mod config;
pub mod kernels;
pub mod machine;
pub mod runspec;

pub use args::{Args, Mode, RunFlags};
pub use config::Config;
pub use kernels::{KernelEntry, KernelList};
pub use machine::{MachineEntry, Manifest, TargetDescriptor};
pub use runspec::{
    Direction, Protocol, ResultName, RunSpec, Series, Threading, ThreadingRole, Tool,
};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String =
        format!("{} result-name/v{}", *VERSION, ResultName::VERSION);
}
