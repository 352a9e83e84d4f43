use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::browser::{close_session, BrowserResult, PageSession, SessionFactory};
use crate::pipeline::Stage;
use crate::system::logical_cores;
use crate::wait::NavigationWaiter;

use super::{Fixed2, Probe, ProbeMetrics, ProbeResult};

const LCP_OBSERVER_SCRIPT: &str = r#"(() => {
  window.__loadscopeLcp = 0;
  try {
    new PerformanceObserver((list) => {
      const entries = list.getEntries();
      const last = entries[entries.length - 1];
      window.__loadscopeLcp = last.renderTime || last.loadTime;
    }).observe({ type: 'largest-contentful-paint', buffered: true });
  } catch (_) {}
})();"#;

const PAINT_TIMINGS_SCRIPT: &str = r#"(() => {
  const paint = (name) => {
    const entry = performance.getEntriesByType('paint').find((e) => e.name === name);
    return entry ? entry.startTime : null;
  };
  const timing = performance.timing;
  return {
    firstPaint: paint('first-paint'),
    firstContentfulPaint: paint('first-contentful-paint'),
    largestContentfulPaint: window.__loadscopeLcp || null,
    domComplete: timing.domComplete > 0 ? timing.domComplete - timing.navigationStart : null
  };
})()"#;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaintTimings {
    first_paint: Option<f64>,
    first_contentful_paint: Option<f64>,
    largest_contentful_paint: Option<f64>,
    dom_complete: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetrics {
    pub time_to_render: Fixed2,
    pub first_paint: Option<Fixed2>,
    pub first_contentful_paint: Option<Fixed2>,
    pub largest_contentful_paint: Option<Fixed2>,
    pub dom_complete: Option<Fixed2>,
    /// Browser CPU seconds spent during the measurement.
    #[serde(rename = "totalCPUUsage")]
    pub total_cpu_usage: Fixed2,
    pub cpu_usage_percentage: Fixed2,
    pub timed_out: bool,
}

pub struct RenderProbe {
    sessions: Arc<dyn SessionFactory>,
    waiter: NavigationWaiter,
    cores: usize,
}

impl RenderProbe {
    pub fn new(sessions: Arc<dyn SessionFactory>, waiter: NavigationWaiter) -> Self {
        Self {
            sessions,
            waiter,
            cores: logical_cores(),
        }
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores.max(1);
        self
    }

    async fn run(&self, url: &str) -> BrowserResult<RenderMetrics> {
        let started = Instant::now();
        let session = self.sessions.open().await?;
        let metrics = self.run_on(session.as_ref(), url, started).await;
        close_session(session, url).await;
        metrics
    }

    async fn run_on(
        &self,
        session: &dyn PageSession,
        url: &str,
        started: Instant,
    ) -> BrowserResult<RenderMetrics> {
        let cpu_before = session.browser_cpu_seconds().await?;
        session.add_init_script(LCP_OBSERVER_SCRIPT).await?;
        let outcome = self.waiter.navigate(session, url).await?;

        let paint = match session.evaluate(PAINT_TIMINGS_SCRIPT).await? {
            Value::Null => PaintTimings::default(),
            value => serde_json::from_value::<PaintTimings>(value)?,
        };
        let cpu_after = session.browser_cpu_seconds().await?;
        let elapsed = started.elapsed();

        let cpu_seconds = (cpu_after - cpu_before).max(0.0);
        let wall_seconds = elapsed.as_secs_f64();
        let cpu_percentage = if wall_seconds > 0.0 {
            cpu_seconds / (self.cores as f64 * wall_seconds) * 100.0
        } else {
            0.0
        };

        Ok(RenderMetrics {
            time_to_render: Fixed2::millis(elapsed),
            first_paint: paint.first_paint.map(Fixed2),
            first_contentful_paint: paint.first_contentful_paint.map(Fixed2),
            largest_contentful_paint: paint.largest_contentful_paint.map(Fixed2),
            dom_complete: paint.dom_complete.map(Fixed2),
            total_cpu_usage: Fixed2(cpu_seconds),
            cpu_usage_percentage: Fixed2(cpu_percentage),
            timed_out: outcome.timed_out,
        })
    }
}

#[async_trait]
impl Probe for RenderProbe {
    fn stage(&self) -> Stage {
        Stage::RenderTime
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        match self.run(url).await {
            Ok(metrics) => {
                info!(
                    url = %url,
                    time_to_render = %metrics.time_to_render,
                    cpu = %metrics.cpu_usage_percentage,
                    "render measured"
                );
                ProbeResult::success(url, ProbeMetrics::Render(metrics))
            }
            Err(err) => {
                warn!(url = %url, error = %err, "render probe failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}
