//! Sequential measurement pipeline and its progress stream.

mod orchestrator;
mod sink;
mod stage;

pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineResult, PipelineRun};
pub use sink::{
    encode_event, parse_event_stream, ChannelSink, EventSink, ProgressEvent, SinkError,
    WriterSink,
};
pub use stage::Stage;
