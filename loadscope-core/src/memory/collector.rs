use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{
    close_session, BrowserError, BrowserResult, PageSession, SessionFactory, TrafficEvent,
};
use crate::config::SamplerSection;
use crate::system::ProcessMeter;
use crate::wait::{LoadOutcome, NavigationWaiter};

use super::series::{DerivedSample, MeasurementSeries, NavigationState, Sample};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const MEMORY_SNAPSHOT_SCRIPT: &str = r#"(() => {
  const memory = window.performance.memory || {};
  return {
    usedJSHeapSize: memory.usedJSHeapSize || 0,
    totalJSHeapSize: memory.totalJSHeapSize || 0,
    jsHeapSizeLimit: memory.jsHeapSizeLimit || 0,
    domNodes: document.getElementsByTagName('*').length,
    resourceCount: performance.getEntriesByType('resource').length
  };
})()"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMemory {
    #[serde(rename = "usedJSHeapSize", default)]
    used_js_heap_size: f64,
    #[serde(rename = "totalJSHeapSize", default)]
    total_js_heap_size: f64,
    #[serde(rename = "jsHeapSizeLimit", default)]
    js_heap_size_limit: f64,
    #[serde(default)]
    dom_nodes: u64,
    #[serde(default)]
    resource_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationWarning {
    pub message: String,
    pub requested: String,
    #[serde(rename = "final")]
    pub final_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub requested_url: String,
    /// Effective URL after redirects.
    pub final_url: String,
    #[serde(rename = "loadTime")]
    pub load_time_ms: i64,
    pub timed_out: bool,
    pub navigation_started_ms: Option<i64>,
    pub measurements: Vec<DerivedSample>,
    pub warnings: Vec<NavigationWarning>,
}

#[derive(Debug, Default)]
struct TrackState {
    series: MeasurementSeries,
    navigation_started: Option<Instant>,
    effective_url: Option<String>,
    discarded: usize,
}

/// Samples heap, DOM and process memory on a fixed tick while a page loads.
pub struct SampleCollector {
    sessions: Arc<dyn SessionFactory>,
    waiter: NavigationWaiter,
    interval: Duration,
    final_sample_attempts: u32,
    meter: Arc<ProcessMeter>,
}

impl SampleCollector {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        waiter: NavigationWaiter,
        sampler: &SamplerSection,
        meter: Arc<ProcessMeter>,
    ) -> Self {
        Self {
            sessions,
            waiter,
            interval: Duration::from_millis(sampler.interval_ms.max(1)),
            final_sample_attempts: sampler.final_sample_attempts.max(1),
            meter,
        }
    }

    pub async fn track(&self, url: &str) -> BrowserResult<MemoryReport> {
        let session = self.sessions.open().await?;
        let report = self.track_on(session.as_ref(), url).await;
        close_session(session, url).await;
        report
    }

    async fn track_on(&self, session: &dyn PageSession, url: &str) -> BrowserResult<MemoryReport> {
        let started = Instant::now();
        let state = Mutex::new(TrackState::default());
        let traffic = session.traffic().await?;
        let load = session.load_events().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let navigation = async {
            let outcome = match session.navigate(url).await {
                Ok(()) => Ok(self.waiter.wait_for_fully_loaded(session, load).await),
                Err(err) => Err(err),
            };
            // Receivers may already be gone if the background loop bailed.
            let _ = stop_tx.send(true);
            outcome
        };
        let background = self.run_background(session, traffic, &state, started, stop_rx);
        let (outcome, ()) = tokio::join!(navigation, background);
        let LoadOutcome { timed_out } = outcome?;

        let loaded_at = Instant::now();
        self.take_final_sample(session, &state, started).await;

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        let navigation_started = state.navigation_started.unwrap_or(started);
        let effective_url = state.effective_url.unwrap_or_else(|| url.to_string());
        let warnings = redirect_warning(url, &effective_url).into_iter().collect();

        info!(
            url = %url,
            samples = state.series.len(),
            discarded = state.discarded,
            timed_out,
            "memory tracking finished"
        );

        Ok(MemoryReport {
            requested_url: url.to_string(),
            final_url: effective_url,
            load_time_ms: millis_between(navigation_started, loaded_at),
            timed_out,
            navigation_started_ms: state
                .navigation_started
                .map(|at| millis_between(started, at)),
            measurements: state.series.derive(),
            warnings,
        })
    }

    async fn run_background(
        &self,
        session: &dyn PageSession,
        mut traffic: BoxStream<'static, TrafficEvent>,
        state: &Mutex<TrackState>,
        started: Instant,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut traffic_open = true;

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                event = traffic.next(), if traffic_open => match event {
                    Some(event) => observe(state, event),
                    None => traffic_open = false,
                },
                _ = ticker.tick() => {
                    self.record(session, state, started, NavigationState::InProgress).await;
                }
            }
        }

        while let Some(Some(event)) = traffic.next().now_or_never() {
            observe(state, event);
        }
    }

    async fn take_final_sample(
        &self,
        session: &dyn PageSession,
        state: &Mutex<TrackState>,
        started: Instant,
    ) {
        for attempt in 1..=self.final_sample_attempts {
            match self.snapshot(session, started, NavigationState::Complete).await {
                Ok(sample) => {
                    lock(state).series.push(sample);
                    return;
                }
                Err(err) if err.is_navigating() => {
                    debug!(attempt, "final sample raced a navigation; retrying");
                    sleep(self.interval).await;
                }
                Err(err) => {
                    warn!(error = %err, "final memory sample failed");
                    return;
                }
            }
        }
        warn!(
            attempts = self.final_sample_attempts,
            "page kept navigating; no final memory sample"
        );
    }

    async fn record(
        &self,
        session: &dyn PageSession,
        state: &Mutex<TrackState>,
        started: Instant,
        navigation_state: NavigationState,
    ) {
        match self.snapshot(session, started, navigation_state).await {
            Ok(sample) => lock(state).series.push(sample),
            Err(err) if err.is_navigating() => lock(state).discarded += 1,
            Err(err) => warn!(error = %err, "memory sample failed"),
        }
    }

    async fn snapshot(
        &self,
        session: &dyn PageSession,
        started: Instant,
        navigation_state: NavigationState,
    ) -> BrowserResult<Sample> {
        let value = timeout(SNAPSHOT_TIMEOUT, session.evaluate(MEMORY_SNAPSHOT_SCRIPT))
            .await
            .map_err(|_| BrowserError::Timeout("memory snapshot".into()))??;
        let memory: PageMemory = serde_json::from_value(value)?;
        Ok(Sample {
            timestamp_ms: millis_between(started, Instant::now()),
            js_heap_size_mb: to_mb(memory.used_js_heap_size),
            total_heap_size_mb: to_mb(memory.total_js_heap_size),
            heap_limit_mb: to_mb(memory.js_heap_size_limit),
            process_memory_mb: self.meter.resident_mb(),
            dom_nodes: memory.dom_nodes,
            resource_count: memory.resource_count,
            navigation_state,
        })
    }
}

fn observe(state: &Mutex<TrackState>, event: TrafficEvent) {
    if let TrafficEvent::RequestSent {
        url,
        is_navigation: true,
        ..
    } = event
    {
        let mut state = lock(state);
        state.navigation_started.get_or_insert_with(Instant::now);
        state.effective_url = Some(url);
    }
}

fn lock(state: &Mutex<TrackState>) -> std::sync::MutexGuard<'_, TrackState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Compares parsed URLs so that a browser-added trailing slash is not
/// reported as a redirect.
fn redirect_warning(requested: &str, effective: &str) -> Option<NavigationWarning> {
    let same = match (Url::parse(requested), Url::parse(effective)) {
        (Ok(a), Ok(b)) => a == b,
        _ => requested == effective,
    };
    (!same).then(|| NavigationWarning {
        message: "Page redirected".to_string(),
        requested: requested.to_string(),
        final_url: effective.to_string(),
    })
}

fn to_mb(bytes: f64) -> f64 {
    (bytes / BYTES_PER_MB).round()
}

fn millis_between(from: Instant, to: Instant) -> i64 {
    to.saturating_duration_since(from).as_millis() as i64
}
