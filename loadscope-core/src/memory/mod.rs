mod collector;
mod series;

pub(crate) use collector::MEMORY_SNAPSHOT_SCRIPT;
pub use collector::{MemoryReport, NavigationWarning, SampleCollector};
pub use series::{DerivedSample, MeasurementSeries, NavigationState, Sample};
