use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::browser::{close_session, BrowserResult, PageSession, SessionFactory};
use crate::config::InteractiveSection;
use crate::pipeline::Stage;
use crate::wait::NavigationWaiter;

use super::{Fixed2, Probe, ProbeMetrics, ProbeResult};

const LONG_TASK_OBSERVER_SCRIPT: &str = r#"(() => {
  window.__loadscopeLastLongTask = 0;
  try {
    new PerformanceObserver((list) => {
      if (list.getEntries().length > 0) {
        window.__loadscopeLastLongTask = performance.now();
      }
    }).observe({ type: 'longtask', buffered: true });
  } catch (_) {}
})();"#;

const LONG_TASK_POLL_SCRIPT: &str = r#"(() => ({
  now: performance.now(),
  lastLongTask: window.__loadscopeLastLongTask || 0
}))()"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LongTaskPoll {
    now: f64,
    last_long_task: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveMetrics {
    pub time_to_interactive: Fixed2,
    /// Page clock reading when the long-task quiet window was satisfied.
    pub time_to_first_interactive: Option<Fixed2>,
    pub script_duration: Option<Fixed2>,
    pub layout_duration: Option<Fixed2>,
    /// Set when the hard cap ended polling before the page went quiet.
    pub forced: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy)]
struct PollSettings {
    quiet_window: Duration,
    poll_interval: Duration,
    hard_cap: Duration,
}

impl From<&InteractiveSection> for PollSettings {
    fn from(section: &InteractiveSection) -> Self {
        Self {
            quiet_window: Duration::from_millis(section.quiet_window_ms),
            poll_interval: Duration::from_millis(section.poll_interval_ms.max(1)),
            hard_cap: Duration::from_millis(section.hard_cap_ms),
        }
    }
}

struct QuietWindow {
    page_time: Option<f64>,
    forced: bool,
}

pub struct InteractiveProbe {
    sessions: Arc<dyn SessionFactory>,
    waiter: NavigationWaiter,
    settings: PollSettings,
}

impl InteractiveProbe {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        waiter: NavigationWaiter,
        section: &InteractiveSection,
    ) -> Self {
        Self {
            sessions,
            waiter,
            settings: PollSettings::from(section),
        }
    }

    async fn run(&self, url: &str) -> BrowserResult<InteractiveMetrics> {
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
    ) -> BrowserResult<InteractiveMetrics> {
        session.add_init_script(LONG_TASK_OBSERVER_SCRIPT).await?;
        let outcome = self.waiter.navigate(session, url).await?;
        let quiet = self.poll_until_quiet(session).await?;
        let metrics = session.performance_metrics().await?;
        let elapsed = started.elapsed();

        Ok(InteractiveMetrics {
            time_to_interactive: Fixed2::millis(elapsed),
            time_to_first_interactive: quiet.page_time.map(Fixed2),
            script_duration: metrics.get("ScriptDuration").copied().map(Fixed2),
            layout_duration: metrics.get("LayoutDuration").copied().map(Fixed2),
            forced: quiet.forced,
            timed_out: outcome.timed_out,
        })
    }

    /// Polls until no long task has been seen for the quiet window. The hard
    /// cap bounds both the loop and each individual evaluation.
    async fn poll_until_quiet(&self, session: &dyn PageSession) -> BrowserResult<QuietWindow> {
        let settings = self.settings;
        let quiet_ms = settings.quiet_window.as_secs_f64() * 1_000.0;
        let deadline = Instant::now() + settings.hard_cap;
        let mut ticker = interval_at(Instant::now() + settings.poll_interval, settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen: Option<(f64, Instant)> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let poll = match timeout(remaining, session.evaluate(LONG_TASK_POLL_SCRIPT)).await {
                Err(_) => break,
                Ok(Err(err)) if err.is_navigating() => {
                    debug!("long-task poll raced a navigation");
                    continue;
                }
                Ok(result) => serde_json::from_value::<LongTaskPoll>(result?)?,
            };
            if poll.now - poll.last_long_task >= quiet_ms {
                return Ok(QuietWindow {
                    page_time: Some(poll.now),
                    forced: false,
                });
            }
            last_seen = Some((poll.now, Instant::now()));
        }

        debug!(cap_ms = settings.hard_cap.as_millis() as u64, "interactive poll hit its cap");
        Ok(QuietWindow {
            page_time: last_seen
                .map(|(page_now, seen_at)| page_now + seen_at.elapsed().as_secs_f64() * 1_000.0),
            forced: true,
        })
    }
}

#[async_trait]
impl Probe for InteractiveProbe {
    fn stage(&self) -> Stage {
        Stage::InteractiveTime
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        match self.run(url).await {
            Ok(metrics) => {
                info!(
                    url = %url,
                    time_to_interactive = %metrics.time_to_interactive,
                    forced = metrics.forced,
                    "interactive measured"
                );
                ProbeResult::success(url, ProbeMetrics::Interactive(metrics))
            }
            Err(err) => {
                warn!(url = %url, error = %err, "interactive probe failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}
