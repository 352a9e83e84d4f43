pub(crate) mod config;
pub(crate) mod measure;
pub(crate) mod monitor;

pub use config::ConfigCommands;
pub use measure::{ProbeArgs, ProbeKind, ProbeOutput, RunArgs, RunSummary};
pub use monitor::{MonitorArgs, MonitorSummary};
