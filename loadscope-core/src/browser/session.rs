use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use super::error::BrowserResult;

/// Network activity observed on a page.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficEvent {
    RequestSent {
        request_id: String,
        url: String,
        is_navigation: bool,
    },
    ResponseReceived {
        request_id: String,
    },
    LoadingFinished {
        request_id: String,
    },
    LoadingFailed {
        request_id: String,
    },
}

impl TrafficEvent {
    pub fn request_id(&self) -> &str {
        match self {
            TrafficEvent::RequestSent { request_id, .. }
            | TrafficEvent::ResponseReceived { request_id }
            | TrafficEvent::LoadingFinished { request_id }
            | TrafficEvent::LoadingFailed { request_id } => request_id,
        }
    }

    /// Request and response events are the ones that restart a quiet period.
    pub fn resets_quiet_period(&self) -> bool {
        matches!(
            self,
            TrafficEvent::RequestSent { .. } | TrafficEvent::ResponseReceived { .. }
        )
    }
}

/// Low-level WebSocket lifecycle events, keyed by the inspector's request id.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Created {
        request_id: String,
        url: String,
    },
    HandshakeRequest {
        request_id: String,
    },
    HandshakeResponse {
        request_id: String,
        status: i64,
        protocol: Option<String>,
    },
    FrameSent {
        request_id: String,
    },
    FrameReceived {
        request_id: String,
    },
    Closed {
        request_id: String,
    },
}

impl SocketEvent {
    pub fn request_id(&self) -> &str {
        match self {
            SocketEvent::Created { request_id, .. }
            | SocketEvent::HandshakeRequest { request_id }
            | SocketEvent::HandshakeResponse { request_id, .. }
            | SocketEvent::FrameSent { request_id }
            | SocketEvent::FrameReceived { request_id }
            | SocketEvent::Closed { request_id } => request_id,
        }
    }
}

/// One controlled browser page. Sessions are owned by the probe that opened
/// them and must be handed back through [`PageSession::close`].
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Registers a script that runs before any page script on every document.
    async fn add_init_script(&self, source: &str) -> BrowserResult<()>;

    /// Subscribes to load events. Subscribe before navigating.
    async fn load_events(&self) -> BrowserResult<BoxStream<'static, ()>>;

    async fn traffic(&self) -> BrowserResult<BoxStream<'static, TrafficEvent>>;

    /// Enables low-level socket inspection and subscribes to its events.
    async fn socket_events(&self) -> BrowserResult<BoxStream<'static, SocketEvent>>;

    /// Dispatches a navigation without waiting for it to finish loading.
    async fn navigate(&self, url: &str) -> BrowserResult<()>;

    /// Evaluates an expression, awaiting promises, and returns its JSON value.
    async fn evaluate(&self, expression: &str) -> BrowserResult<Value>;

    async fn performance_metrics(&self) -> BrowserResult<HashMap<String, f64>>;

    /// Total CPU seconds consumed by the browser's processes so far.
    async fn browser_cpu_seconds(&self) -> BrowserResult<f64>;

    async fn close(self: Box<Self>) -> BrowserResult<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> BrowserResult<Box<dyn PageSession>>;
}

/// Closes a session, logging rather than propagating a close failure.
pub async fn close_session(session: Box<dyn PageSession>, url: &str) {
    if let Err(err) = session.close().await {
        tracing::warn!(url = %url, error = %err, "failed to close browser session");
    }
}
