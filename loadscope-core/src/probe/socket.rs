use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::{close_session, BrowserResult, PageSession, SessionFactory, SocketEvent};
use crate::config::SocketSection;
use crate::pipeline::Stage;
use crate::wait::wait_for_inflight_idle;

use super::{Probe, ProbeMetrics, ProbeResult};

const UNKNOWN_PROTOCOL: &str = "unknown";
const SWITCHING_PROTOCOLS: i64 = 101;

/// Wraps the page's WebSocket constructor so scripted connections are
/// recorded even when the inspector misses them.
const SOCKET_HOOK_SCRIPT: &str = r#"(() => {
  if (window.__loadscopeSockets) return;
  const records = [];
  window.__loadscopeSockets = records;
  const Native = window.WebSocket;
  if (!Native) return;
  const Hooked = function (...args) {
    const ws = new Native(...args);
    const record = {
      url: String(args[0]),
      protocol: ws.protocol || '',
      created: new Date().toISOString(),
      lastActive: null,
      state: 'connecting',
      sent: 0,
      received: 0
    };
    records.push(record);
    const touch = () => { record.lastActive = new Date().toISOString(); };
    ws.addEventListener('open', () => { record.state = 'connected'; record.protocol = ws.protocol || record.protocol; });
    ws.addEventListener('message', () => { record.received += 1; touch(); });
    ws.addEventListener('close', () => { record.state = 'closed'; });
    const send = ws.send.bind(ws);
    ws.send = (data) => { record.sent += 1; touch(); return send(data); };
    return ws;
  };
  Hooked.prototype = Native.prototype;
  Object.assign(Hooked, { CONNECTING: 0, OPEN: 1, CLOSING: 2, CLOSED: 3 });
  window.WebSocket = Hooked;
})();"#;

const SOCKET_REPORT_SCRIPT: &str = "(() => (window.__loadscopeSockets || []).map((r) => Object.assign({}, r)))()";

const SOCKET_IO_SCRIPT: &str = r#"(() => {
  if (!window.io || !window.io.sockets) return [];
  return Object.keys(window.io.sockets).map((id) => ({
    id,
    namespace: String(window.io.sockets[id].nsp || '/')
  }));
})()"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Closed,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionSource {
    Inspector,
    Page,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub url: String,
    pub protocol: String,
    pub status: ConnectionStatus,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub established_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub source: ConnectionSource,
}

impl ConnectionRecord {
    fn new(url: String, source: ConnectionSource, at: DateTime<Utc>) -> Self {
        Self {
            url,
            protocol: UNKNOWN_PROTOCOL.to_string(),
            status: ConnectionStatus::Connecting,
            messages_sent: 0,
            messages_received: 0,
            established_at: at,
            last_active_at: at,
            source,
        }
    }

    fn has_protocol(&self) -> bool {
        !self.protocol.is_empty() && self.protocol != UNKNOWN_PROTOCOL
    }

    fn richness(&self) -> (u64, ConnectionStatus, bool) {
        (
            self.messages_sent + self.messages_received,
            self.status,
            self.source == ConnectionSource::Inspector,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketIoNamespace {
    pub id: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketReport {
    pub connections: Vec<ConnectionRecord>,
    /// Connections whose handshake completed and that were still open.
    pub total_connections: usize,
    #[serde(rename = "socketIo")]
    pub socket_io: Vec<SocketIoNamespace>,
    /// Whether the page never reached zero in-flight requests.
    pub idle_capped: bool,
}

/// Builds connection records from inspector events keyed by request id.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    order: Vec<String>,
    records: HashMap<String, ConnectionRecord>,
}

impl ConnectionTracker {
    pub fn apply(&mut self, event: SocketEvent, at: DateTime<Utc>) {
        match event {
            SocketEvent::Created { request_id, url } => {
                if !self.records.contains_key(&request_id) {
                    self.order.push(request_id.clone());
                    self.records.insert(
                        request_id,
                        ConnectionRecord::new(url, ConnectionSource::Inspector, at),
                    );
                }
            }
            SocketEvent::HandshakeRequest { request_id } => {
                if let Some(record) = self.records.get_mut(&request_id) {
                    record.status = ConnectionStatus::Connecting;
                }
            }
            SocketEvent::HandshakeResponse {
                request_id,
                status,
                protocol,
            } => {
                if let Some(record) = self.records.get_mut(&request_id) {
                    if status == SWITCHING_PROTOCOLS {
                        record.status = ConnectionStatus::Connected;
                    }
                    if let Some(protocol) = protocol {
                        record.protocol = protocol;
                    }
                    record.last_active_at = at;
                }
            }
            SocketEvent::FrameSent { request_id } => {
                if let Some(record) = self.records.get_mut(&request_id) {
                    record.messages_sent += 1;
                    record.last_active_at = at;
                }
            }
            SocketEvent::FrameReceived { request_id } => {
                if let Some(record) = self.records.get_mut(&request_id) {
                    record.messages_received += 1;
                    record.last_active_at = at;
                }
            }
            SocketEvent::Closed { request_id } => {
                if let Some(record) = self.records.get_mut(&request_id) {
                    record.status = ConnectionStatus::Closed;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(mut self) -> Vec<ConnectionRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect()
    }
}

/// Collapses records that share an exact URL string, keeping the one with
/// the most traffic and the most advanced status. A missing protocol is
/// filled in from the discarded duplicate. First-seen order is kept.
pub fn merge_connections(
    inspector: Vec<ConnectionRecord>,
    page: Vec<ConnectionRecord>,
) -> Vec<ConnectionRecord> {
    let mut merged: Vec<ConnectionRecord> = Vec::new();
    for record in inspector.into_iter().chain(page) {
        match merged.iter_mut().find(|existing| existing.url == record.url) {
            Some(existing) => {
                let (mut keep, other) = if record.richness() > existing.richness() {
                    (record, existing.clone())
                } else {
                    (existing.clone(), record)
                };
                if !keep.has_protocol() && other.has_protocol() {
                    keep.protocol = other.protocol;
                }
                keep.established_at = keep.established_at.min(other.established_at);
                keep.last_active_at = keep.last_active_at.max(other.last_active_at);
                *existing = keep;
            }
            None => merged.push(record),
        }
    }
    merged
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageSocket {
    url: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    last_active: Option<String>,
    #[serde(default)]
    state: Option<ConnectionStatus>,
    #[serde(default)]
    sent: u64,
    #[serde(default)]
    received: u64,
}

impl PageSocket {
    fn into_record(self, fallback: DateTime<Utc>) -> ConnectionRecord {
        let parse = |stamp: Option<&str>| {
            stamp
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&Utc))
        };
        let established_at = parse(self.created.as_deref()).unwrap_or(fallback);
        let last_active_at = parse(self.last_active.as_deref()).unwrap_or(established_at);
        ConnectionRecord {
            url: self.url,
            protocol: if self.protocol.is_empty() {
                UNKNOWN_PROTOCOL.to_string()
            } else {
                self.protocol
            },
            status: self.state.unwrap_or(ConnectionStatus::Connecting),
            messages_sent: self.sent,
            messages_received: self.received,
            established_at,
            last_active_at,
            source: ConnectionSource::Page,
        }
    }
}

pub struct SocketProbe {
    sessions: Arc<dyn SessionFactory>,
    idle_window: Duration,
    idle_cap: Duration,
    settle: Duration,
}

impl SocketProbe {
    pub fn new(sessions: Arc<dyn SessionFactory>, section: &SocketSection) -> Self {
        Self {
            sessions,
            idle_window: Duration::from_millis(section.idle_window_ms),
            idle_cap: Duration::from_millis(section.idle_cap_ms),
            settle: Duration::from_millis(section.settle_ms),
        }
    }

    async fn run(&self, url: &str) -> BrowserResult<SocketReport> {
        let session = self.sessions.open().await?;
        let report = self.run_on(session.as_ref(), url).await;
        close_session(session, url).await;
        report
    }

    async fn run_on(&self, session: &dyn PageSession, url: &str) -> BrowserResult<SocketReport> {
        let mut events = session.socket_events().await?;
        session.add_init_script(SOCKET_HOOK_SCRIPT).await?;
        let traffic = session.traffic().await?;
        session.navigate(url).await?;

        let settle = async {
            let idle = wait_for_inflight_idle(traffic, self.idle_window, self.idle_cap).await;
            tokio::time::sleep(self.settle).await;
            !idle
        };
        tokio::pin!(settle);

        let mut tracker = ConnectionTracker::default();
        let idle_capped = loop {
            tokio::select! {
                capped = &mut settle => break capped,
                Some(event) = events.next() => tracker.apply(event, Utc::now()),
            }
        };
        while let Some(Some(event)) = events.next().now_or_never() {
            tracker.apply(event, Utc::now());
        }
        drop(events);

        let page_records = read_page_sockets(session).await;
        let socket_io = read_socket_io(session).await;
        let inspector_records = tracker.into_records();
        debug!(
            inspector = inspector_records.len(),
            page = page_records.len(),
            "socket sources collected"
        );

        let connections = merge_connections(inspector_records, page_records);
        let total_connections = connections
            .iter()
            .filter(|record| record.status == ConnectionStatus::Connected)
            .count();
        Ok(SocketReport {
            connections,
            total_connections,
            socket_io,
            idle_capped,
        })
    }
}

async fn read_page_sockets(session: &dyn PageSession) -> Vec<ConnectionRecord> {
    let now = Utc::now();
    match evaluate_list::<PageSocket>(session, SOCKET_REPORT_SCRIPT).await {
        Ok(sockets) => sockets
            .into_iter()
            .map(|socket| socket.into_record(now))
            .collect(),
        Err(err) => {
            debug!(error = %err, "page socket report unavailable");
            Vec::new()
        }
    }
}

async fn read_socket_io(session: &dyn PageSession) -> Vec<SocketIoNamespace> {
    evaluate_list(session, SOCKET_IO_SCRIPT)
        .await
        .unwrap_or_else(|err| {
            debug!(error = %err, "socket.io namespaces unavailable");
            Vec::new()
        })
}

async fn evaluate_list<T>(session: &dyn PageSession, script: &str) -> BrowserResult<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let value = session.evaluate(script).await?;
    if value == Value::Null {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl Probe for SocketProbe {
    fn stage(&self) -> Stage {
        Stage::SocketAnalysis
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        match self.run(url).await {
            Ok(report) => {
                info!(
                    url = %url,
                    connections = report.connections.len(),
                    connected = report.total_connections,
                    "sockets analysed"
                );
                ProbeResult::success(url, ProbeMetrics::Socket(report))
            }
            Err(err) => {
                warn!(url = %url, error = %err, "socket probe failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn tracker_follows_handshake_and_frames() {
        let mut tracker = ConnectionTracker::default();
        tracker.apply(
            SocketEvent::Created {
                request_id: "7".into(),
                url: "wss://echo.test/".into(),
            },
            at(1),
        );
        tracker.apply(SocketEvent::HandshakeRequest { request_id: "7".into() }, at(1));
        tracker.apply(
            SocketEvent::HandshakeResponse {
                request_id: "7".into(),
                status: 101,
                protocol: Some("chat".into()),
            },
            at(2),
        );
        tracker.apply(SocketEvent::FrameSent { request_id: "7".into() }, at(3));
        tracker.apply(SocketEvent::FrameReceived { request_id: "7".into() }, at(4));
        tracker.apply(SocketEvent::FrameReceived { request_id: "8".into() }, at(4));

        let records = tracker.into_records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.status, ConnectionStatus::Connected);
        assert_eq!(record.protocol, "chat");
        assert_eq!((record.messages_sent, record.messages_received), (1, 1));
        assert_eq!(record.established_at, at(1));
        assert_eq!(record.last_active_at, at(4));
    }

    #[test]
    fn merge_keeps_richer_record_and_fills_protocol() {
        let mut inspector = ConnectionRecord::new(
            "wss://echo.test/".into(),
            ConnectionSource::Inspector,
            at(5),
        );
        inspector.status = ConnectionStatus::Connected;
        let mut page =
            ConnectionRecord::new("wss://echo.test/".into(), ConnectionSource::Page, at(4));
        page.status = ConnectionStatus::Connected;
        page.protocol = "graphql-ws".into();
        page.messages_received = 3;
        let other = ConnectionRecord::new("wss://other.test/".into(), ConnectionSource::Page, at(6));

        let merged = merge_connections(vec![inspector], vec![page, other]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, ConnectionSource::Page);
        assert_eq!(merged[0].messages_received, 3);
        assert_eq!(merged[0].protocol, "graphql-ws");
        assert_eq!(merged[0].established_at, at(4));
        assert_eq!(merged[1].url, "wss://other.test/");
    }

    #[test]
    fn equal_records_prefer_inspector() {
        let mut inspector =
            ConnectionRecord::new("wss://a.test/".into(), ConnectionSource::Inspector, at(1));
        inspector.status = ConnectionStatus::Connected;
        let mut page = ConnectionRecord::new("wss://a.test/".into(), ConnectionSource::Page, at(1));
        page.status = ConnectionStatus::Connected;
        page.protocol = "chat".into();

        let merged = merge_connections(vec![inspector], vec![page]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, ConnectionSource::Inspector);
        assert_eq!(merged[0].protocol, "chat");
    }

    #[test]
    fn page_socket_defaults_to_unknown_protocol() {
        let socket: PageSocket = serde_json::from_value(serde_json::json!({
            "url": "wss://a.test/",
            "protocol": "",
            "created": "2024-05-01T10:00:00.000Z",
            "state": "connected",
            "sent": 2,
            "received": 0
        }))
        .unwrap();
        let record = socket.into_record(at(0));
        assert_eq!(record.protocol, "unknown");
        assert_eq!(record.status, ConnectionStatus::Connected);
        assert_eq!(record.last_active_at, record.established_at);
    }
}
