use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::browser::{BrowserResult, PageSession};
use crate::config::NavigationSection;

use super::idle::NetworkIdleDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub quiet_threshold: Duration,
    pub max_wait: Duration,
    pub pause_after_load: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from(&NavigationSection::default())
    }
}

impl From<&NavigationSection> for WaitOptions {
    fn from(section: &NavigationSection) -> Self {
        Self {
            quiet_threshold: Duration::from_millis(section.quiet_threshold_ms),
            max_wait: Duration::from_millis(section.max_wait_ms),
            pause_after_load: Duration::from_millis(section.pause_after_load_ms),
        }
    }
}

impl WaitOptions {
    /// Longest time [`NavigationWaiter::wait_for_fully_loaded`] can take.
    pub fn upper_bound(&self) -> Duration {
        self.max_wait + self.quiet_threshold + self.pause_after_load
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub timed_out: bool,
}

/// Best-effort "page is ready" signal: load event, then network quiet, then a
/// settle pause. Never fails; problems are reported as `timed_out`.
///
/// Load and idle share one deadline: the load event must arrive within
/// `max_wait`, and network quiet must follow before `max_wait` plus one quiet
/// threshold has passed since the wait began.
#[derive(Debug, Clone, Default)]
pub struct NavigationWaiter {
    options: WaitOptions,
}

impl NavigationWaiter {
    pub fn new(options: WaitOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WaitOptions {
        &self.options
    }

    /// Waits on a load subscription that was opened before the navigation
    /// was dispatched.
    pub async fn wait_for_fully_loaded(
        &self,
        session: &dyn PageSession,
        mut load: BoxStream<'static, ()>,
    ) -> LoadOutcome {
        let started = Instant::now();
        match timeout(self.options.max_wait, load.next()).await {
            Ok(Some(())) => {}
            Ok(None) => {
                debug!("load subscription ended before the load event");
                return LoadOutcome { timed_out: true };
            }
            Err(_) => {
                debug!(max_wait_ms = self.options.max_wait.as_millis() as u64, "load event deadline reached");
                return LoadOutcome { timed_out: true };
            }
        }
        drop(load);

        let traffic = match session.traffic().await {
            Ok(traffic) => traffic,
            Err(err) => {
                warn!(error = %err, "traffic subscription failed after load");
                return LoadOutcome { timed_out: true };
            }
        };
        let idle_deadline = started + self.options.max_wait + self.options.quiet_threshold;
        let detector = NetworkIdleDetector::start(traffic, self.options.quiet_threshold);
        let timed_out = match timeout_at(idle_deadline, detector.wait()).await {
            Ok(resets) => {
                debug!(resets, "network idle after load");
                false
            }
            Err(_) => {
                debug!("network never went quiet before the deadline");
                true
            }
        };

        tokio::time::sleep(self.options.pause_after_load).await;
        LoadOutcome { timed_out }
    }

    /// Subscribes to load events, dispatches the navigation and waits for it.
    pub async fn navigate(
        &self,
        session: &dyn PageSession,
        url: &str,
    ) -> BrowserResult<LoadOutcome> {
        let load = session.load_events().await?;
        session.navigate(url).await?;
        Ok(self.wait_for_fully_loaded(session, load).await)
    }
}
