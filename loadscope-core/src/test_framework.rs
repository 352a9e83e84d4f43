//! Scripted collaborators for exercising probes and pipelines without a
//! browser or network. Timed behaviour is relative to the scripted
//! navigation and is meant to run under a paused tokio clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};

use crate::browser::{
    BrowserError, BrowserResult, PageSession, SessionFactory, SocketEvent, TrafficEvent,
};
use crate::pipeline::{EventSink, ProgressEvent, SinkError, Stage};
use crate::probe::{
    AuditEngine, AuditRequest, FetchedHead, Fetcher, Probe, ProbeMetrics, ProbeResult,
    ResponseHeaders,
};

/// Substrings identifying the scripts probes evaluate.
pub mod markers {
    pub const MEMORY: &str = "usedJSHeapSize";
    pub const PAINT: &str = "first-contentful-paint";
    pub const LONG_TASK_POLL: &str = "lastLongTask";
    pub const PAGE_SOCKETS: &str = "__loadscopeSockets";
    pub const SOCKET_IO: &str = "window.io";
}

/// What an evaluate rule sees when it is asked for a value.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub since_navigate: Option<Duration>,
    pub call: usize,
}

type Responder = Arc<dyn Fn(EvalContext) -> BrowserResult<Value> + Send + Sync>;

#[derive(Clone)]
struct EvaluateRule {
    marker: String,
    respond: Responder,
    calls: Arc<AtomicUsize>,
}

/// Timeline and responses for a [`ScriptedSession`]. Offsets are measured
/// from the moment `navigate` is called.
#[derive(Clone, Default)]
pub struct SessionScript {
    traffic: Vec<(Duration, TrafficEvent)>,
    sockets: Vec<(Duration, SocketEvent)>,
    load_after: Option<Duration>,
    navigate_error: Option<String>,
    rules: Vec<EvaluateRule>,
    metrics: HashMap<String, f64>,
    cpu_seconds_per_read: f64,
}

impl SessionScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_at(mut self, offset_ms: u64) -> Self {
        self.load_after = Some(Duration::from_millis(offset_ms));
        self
    }

    pub fn traffic_at(mut self, offset_ms: u64, event: TrafficEvent) -> Self {
        self.traffic.push((Duration::from_millis(offset_ms), event));
        self
    }

    /// A navigation request for `url` at `offset_ms`, finished right away.
    pub fn document_at(self, offset_ms: u64, request_id: &str, url: &str) -> Self {
        self.traffic_at(
            offset_ms,
            TrafficEvent::RequestSent {
                request_id: request_id.to_string(),
                url: url.to_string(),
                is_navigation: true,
            },
        )
        .traffic_at(
            offset_ms,
            TrafficEvent::ResponseReceived {
                request_id: request_id.to_string(),
            },
        )
        .traffic_at(
            offset_ms,
            TrafficEvent::LoadingFinished {
                request_id: request_id.to_string(),
            },
        )
    }

    pub fn socket_at(mut self, offset_ms: u64, event: SocketEvent) -> Self {
        self.sockets.push((Duration::from_millis(offset_ms), event));
        self
    }

    pub fn fail_navigation(mut self, message: &str) -> Self {
        self.navigate_error = Some(message.to_string());
        self
    }

    pub fn metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn cpu_seconds_per_read(mut self, seconds: f64) -> Self {
        self.cpu_seconds_per_read = seconds;
        self
    }

    /// Answers every evaluated expression containing `marker`.
    pub fn on_evaluate<F>(mut self, marker: &str, respond: F) -> Self
    where
        F: Fn(EvalContext) -> BrowserResult<Value> + Send + Sync + 'static,
    {
        self.rules.push(EvaluateRule {
            marker: marker.to_string(),
            respond: Arc::new(respond),
            calls: Arc::new(AtomicUsize::new(0)),
        });
        self
    }

    /// Answers with a fixed value.
    pub fn on_evaluate_value(self, marker: &str, value: Value) -> Self {
        self.on_evaluate(marker, move |_| Ok(value.clone()))
    }
}

/// A heap snapshot as the page would report it, sizes in megabytes.
pub fn memory_snapshot(used_mb: f64, total_mb: f64, limit_mb: f64, dom_nodes: u64) -> Value {
    const MB: f64 = 1024.0 * 1024.0;
    json!({
        "usedJSHeapSize": used_mb * MB,
        "totalJSHeapSize": total_mb * MB,
        "jsHeapSizeLimit": limit_mb * MB,
        "domNodes": dom_nodes,
        "resourceCount": 1,
    })
}

#[derive(Debug, Default)]
struct LogInner {
    opened: usize,
    closed: usize,
    navigations: Vec<String>,
    init_scripts: Vec<String>,
}

/// Shared record of what scripted sessions were asked to do.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    inner: Arc<Mutex<LogInner>>,
}

impl SessionLog {
    fn with<R>(&self, f: impl FnOnce(&mut LogInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    pub fn opened(&self) -> usize {
        self.with(|log| log.opened)
    }

    pub fn closed(&self) -> usize {
        self.with(|log| log.closed)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.with(|log| log.navigations.clone())
    }

    pub fn init_scripts(&self) -> Vec<String> {
        self.with(|log| log.init_scripts.clone())
    }
}

pub struct ScriptedSession {
    script: SessionScript,
    log: SessionLog,
    navigated_at: Mutex<Option<Instant>>,
    cpu_reads: AtomicUsize,
    traffic_tx: broadcast::Sender<TrafficEvent>,
    socket_tx: broadcast::Sender<SocketEvent>,
    load_tx: broadcast::Sender<()>,
}

impl ScriptedSession {
    pub fn new(script: SessionScript, log: SessionLog) -> Self {
        let (traffic_tx, _) = broadcast::channel(1024);
        let (socket_tx, _) = broadcast::channel(256);
        let (load_tx, _) = broadcast::channel(8);
        Self {
            script,
            log,
            navigated_at: Mutex::new(None),
            cpu_reads: AtomicUsize::new(0),
            traffic_tx,
            socket_tx,
            load_tx,
        }
    }

    fn since_navigate(&self) -> Option<Duration> {
        self.navigated_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed())
    }

    fn schedule<T>(sender: &broadcast::Sender<T>, origin: Instant, mut timeline: Vec<(Duration, T)>)
    where
        T: Clone + Send + 'static,
    {
        if timeline.is_empty() {
            return;
        }
        timeline.sort_by_key(|(offset, _)| *offset);
        let sender = sender.clone();
        tokio::spawn(async move {
            for (offset, event) in timeline {
                sleep_until(origin + offset).await;
                let _ = sender.send(event);
            }
        });
    }
}

fn subscribe<T>(sender: &broadcast::Sender<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(sender.subscribe(), |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn add_init_script(&self, source: &str) -> BrowserResult<()> {
        self.log.with(|log| log.init_scripts.push(source.to_string()));
        Ok(())
    }

    async fn load_events(&self) -> BrowserResult<BoxStream<'static, ()>> {
        Ok(subscribe(&self.load_tx))
    }

    async fn traffic(&self) -> BrowserResult<BoxStream<'static, TrafficEvent>> {
        Ok(subscribe(&self.traffic_tx))
    }

    async fn socket_events(&self) -> BrowserResult<BoxStream<'static, SocketEvent>> {
        Ok(subscribe(&self.socket_tx))
    }

    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        self.log.with(|log| log.navigations.push(url.to_string()));
        if let Some(message) = &self.script.navigate_error {
            return Err(BrowserError::Navigation(format!("{url}: {message}")));
        }
        let origin = Instant::now();
        *self.navigated_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(origin);
        Self::schedule(&self.traffic_tx, origin, self.script.traffic.clone());
        Self::schedule(&self.socket_tx, origin, self.script.sockets.clone());
        if let Some(offset) = self.script.load_after {
            Self::schedule(&self.load_tx, origin, vec![(offset, ())]);
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> BrowserResult<Value> {
        let Some(rule) = self
            .script
            .rules
            .iter()
            .find(|rule| expression.contains(rule.marker.as_str()))
        else {
            return Ok(Value::Null);
        };
        let call = rule.calls.fetch_add(1, Ordering::SeqCst);
        (rule.respond)(EvalContext {
            since_navigate: self.since_navigate(),
            call,
        })
    }

    async fn performance_metrics(&self) -> BrowserResult<HashMap<String, f64>> {
        Ok(self.script.metrics.clone())
    }

    async fn browser_cpu_seconds(&self) -> BrowserResult<f64> {
        let reads = self.cpu_reads.fetch_add(1, Ordering::SeqCst);
        Ok(reads as f64 * self.script.cpu_seconds_per_read)
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        self.log.with(|log| log.closed += 1);
        Ok(())
    }
}

/// Opens [`ScriptedSession`]s that all follow the same script.
#[derive(Clone, Default)]
pub struct ScriptedSessionFactory {
    script: SessionScript,
    log: SessionLog,
    open_error: Option<String>,
}

impl ScriptedSessionFactory {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            log: SessionLog::default(),
            open_error: None,
        }
    }

    /// Every `open` fails as if the browser could not start.
    pub fn failing(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn log(&self) -> SessionLog {
        self.log.clone()
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    async fn open(&self) -> BrowserResult<Box<dyn PageSession>> {
        if let Some(message) = &self.open_error {
            return Err(BrowserError::Launch(message.clone()));
        }
        self.log.with(|log| log.opened += 1);
        Ok(Box::new(ScriptedSession::new(
            self.script.clone(),
            self.log.clone(),
        )))
    }
}

/// Serves one document. Latency is applied by advancing the paused clock,
/// so elapsed-time measurements come out exact.
#[derive(Debug, Clone)]
pub struct StaticFetcher {
    body: String,
    latency: Duration,
    head: FetchedHead,
    error: Option<String>,
}

impl StaticFetcher {
    pub fn new(body: &str) -> Self {
        Self {
            body: body.to_string(),
            latency: Duration::ZERO,
            head: FetchedHead {
                status: 200,
                headers: ResponseHeaders {
                    server: Some("static".to_string()),
                    content_type: Some("text/html".to_string()),
                    content_length: Some(body.len() as u64),
                },
                timing: None,
            },
            error: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        let mut fetcher = Self::new("");
        fetcher.error = Some(message.to_string());
        fetcher
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn respond(&self) -> BrowserResult<()> {
        if !self.latency.is_zero() {
            tokio::time::advance(self.latency).await;
        }
        match &self.error {
            Some(message) => Err(BrowserError::Network(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_text(&self, _url: &str) -> BrowserResult<String> {
        self.respond().await?;
        Ok(self.body.clone())
    }

    async fn fetch_head(&self, _url: &str) -> BrowserResult<FetchedHead> {
        self.respond().await?;
        Ok(self.head.clone())
    }
}

/// Returns a canned report, or fails, and remembers every request.
#[derive(Debug, Default)]
pub struct StaticAuditEngine {
    report: Option<Value>,
    requests: Mutex<Vec<AuditRequest>>,
}

impl StaticAuditEngine {
    pub fn new(report: Value) -> Self {
        Self {
            report: Some(report),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<AuditRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditEngine for StaticAuditEngine {
    async fn run(&self, request: &AuditRequest) -> BrowserResult<Value> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.report
            .clone()
            .ok_or_else(|| BrowserError::Audit("lighthouse exited with status 1".into()))
    }
}

/// A minimal Lighthouse result with every mapped category and metric.
pub fn sample_lighthouse_report() -> Value {
    let metric = |score: f64, value: f64, display: &str| {
        json!({"score": score, "numericValue": value, "displayValue": display})
    };
    json!({
        "finalUrl": "https://example.test/",
        "fetchTime": "2024-05-01T10:00:00.000Z",
        "categories": {
            "performance": {"score": 0.874},
            "accessibility": {"score": 0.9},
            "best-practices": {"score": 1.0},
            "seo": {"score": 0.555}
        },
        "audits": {
            "largest-contentful-paint": metric(0.8, 2100.5, "2.1 s"),
            "max-potential-fid": metric(0.9, 120.0, "120 ms"),
            "cumulative-layout-shift": metric(1.0, 0.01, "0.01"),
            "first-contentful-paint": metric(0.95, 900.0, "0.9 s"),
            "speed-index": metric(0.7, 3000.0, "3.0 s"),
            "interactive": metric(0.6, 4000.0, "4.0 s"),
            "total-blocking-time": metric(0.5, 350.0, "350 ms"),
            "server-response-time": metric(1.0, 80.0, "Root document took 80 ms"),
            "first-meaningful-paint": metric(0.95, 950.0, "1.0 s"),
            "load-fast-enough-for-pwa": metric(1.0, 3200.0, "3.2 s"),
            "render-blocking-resources": {
                "title": "Eliminate render-blocking resources",
                "description": "Resources are blocking the first paint.",
                "score": 0.4,
                "numericValue": 420.0,
                "displayValue": "Potential savings of 420 ms",
                "details": {"type": "opportunity", "items": []}
            },
            "bootup-time": {
                "score": 1.0,
                "details": {"type": "table", "items": [{"url": "https://example.test/app.js", "total": 120.0}]}
            }
        },
        "configSettings": {
            "formFactor": "desktop",
            "throttlingMethod": "simulate",
            "throttling": {"rttMs": 40, "throughputKbps": 10240, "cpuSlowdownMultiplier": 1},
            "onlyCategories": ["performance", "accessibility", "best-practices", "seo"]
        },
        "runWarnings": ["The page loaded too slowly to finish within the time limit."],
        "environment": {
            "networkUserAgent": "Mozilla/5.0",
            "hostUserAgent": "HeadlessChrome",
            "benchmarkIndex": 1500.0
        }
    })
}

/// What a [`StubProbe`] does when measured.
#[derive(Debug, Clone)]
pub enum StubOutcome {
    Succeed(ProbeMetrics),
    Fail(String),
    Panic(String),
}

/// A probe with a fixed outcome that counts its invocations.
pub struct StubProbe {
    stage: Stage,
    outcome: StubOutcome,
    calls: AtomicUsize,
}

impl StubProbe {
    pub fn new(stage: Stage, outcome: StubOutcome) -> Self {
        Self {
            stage,
            outcome,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for StubProbe {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            StubOutcome::Succeed(metrics) => ProbeResult::success(url, metrics.clone()),
            StubOutcome::Fail(message) => ProbeResult::failure(url, message),
            StubOutcome::Panic(message) => panic!("{message}"),
        }
    }
}

/// Keeps every emitted event; optionally refuses emits after a count.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<ProgressEvent>,
    pub closes: usize,
    fail_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `count` events, then behaves like a disconnected receiver.
    pub fn disconnecting_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::default()
        }
    }

    pub fn stages(&self) -> Vec<String> {
        self.events.iter().map(|event| event.stage.clone()).collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.events.iter().filter(|event| event.is_terminal()).count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&mut self, event: &ProgressEvent) -> Result<(), SinkError> {
        if self.closes > 0 || self.fail_after.is_some_and(|limit| self.events.len() >= limit) {
            return Err(SinkError::Closed);
        }
        self.events.push(event.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.closes += 1;
        Ok(())
    }
}
