use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::pipeline::Stage;

use super::fetch::{Fetcher, ResponseHeaders, TimingBreakdown};
use super::{Fixed2, Probe, ProbeMetrics, ProbeResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtfbMetrics {
    pub ttfb: Fixed2,
    pub status: u16,
    pub headers: ResponseHeaders,
    #[serde(flatten)]
    pub timing: TimingBreakdown,
}

/// Wall-clock time from dispatching a single uncached GET to receiving its
/// response headers.
pub struct TtfbProbe {
    fetcher: Arc<dyn Fetcher>,
}

impl TtfbProbe {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Probe for TtfbProbe {
    fn stage(&self) -> Stage {
        Stage::Ttfb
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        let started = Instant::now();
        match self.fetcher.fetch_head(url).await {
            Ok(head) => {
                let ttfb = Fixed2::millis(started.elapsed());
                info!(url = %url, ttfb = %ttfb, status = head.status, "ttfb measured");
                ProbeResult::success(
                    url,
                    ProbeMetrics::Ttfb(TtfbMetrics {
                        ttfb,
                        status: head.status,
                        headers: head.headers,
                        timing: head.timing.unwrap_or_default(),
                    }),
                )
            }
            Err(err) => {
                warn!(url = %url, error = %err, "ttfb probe failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}
