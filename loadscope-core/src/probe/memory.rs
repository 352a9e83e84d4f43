use async_trait::async_trait;
use tracing::{info, warn};

use crate::memory::SampleCollector;
use crate::pipeline::Stage;

use super::{Probe, ProbeMetrics, ProbeResult};

/// Heap series for one page load, reported through the probe envelope.
pub struct MemoryProbe {
    collector: SampleCollector,
}

impl MemoryProbe {
    pub fn new(collector: SampleCollector) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl Probe for MemoryProbe {
    fn stage(&self) -> Stage {
        Stage::HeapSeries
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        match self.collector.track(url).await {
            Ok(report) => {
                info!(
                    url = %url,
                    samples = report.measurements.len(),
                    redirected = !report.warnings.is_empty(),
                    "heap series recorded"
                );
                ProbeResult::success(url, ProbeMetrics::Memory(report))
            }
            Err(err) => {
                warn!(url = %url, error = %err, "memory tracking failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}
