pub mod browser;
pub mod config;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod probe;
pub mod system;
pub mod test_framework;
pub mod wait;

pub use browser::{BrowserError, BrowserLauncher, BrowserResult, PageSession, SessionFactory};
pub use config::{load_loadscope_config, LoadscopeConfig};
pub use error::{ConfigError, Result};
pub use memory::{MemoryReport, SampleCollector};
pub use pipeline::{
    ChannelSink, EventSink, PipelineError, PipelineOrchestrator, PipelineRun, ProgressEvent,
    Stage, WriterSink,
};
pub use probe::{Probe, ProbeMetrics, ProbeResult, ProbeSet};
pub use wait::{NavigationWaiter, WaitOptions};
