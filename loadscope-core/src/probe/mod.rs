//! Single-purpose measurements. Every probe reports through the same
//! [`ProbeResult`] envelope and never returns an error to its caller.

mod audit;
mod fetch;
mod interactive;
mod memory;
mod render;
mod set;
mod socket;
mod title;
mod ttfb;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::pipeline::Stage;

pub use audit::{
    summarize_report, AuditEngine, AuditMetric, AuditOpportunity, AuditProbe, AuditRequest,
    AuditScores, AuditSummary, KeyMetrics, LighthouseCli, ReportEnvironment,
};
pub use fetch::{FetchedHead, Fetcher, ReqwestFetcher, ResponseHeaders, TimingBreakdown};
pub use interactive::{InteractiveMetrics, InteractiveProbe};
pub use memory::MemoryProbe;
pub use render::{RenderMetrics, RenderProbe};
pub use set::ProbeSet;
pub use socket::{
    merge_connections, ConnectionRecord, ConnectionSource, ConnectionStatus, ConnectionTracker,
    SocketIoNamespace, SocketProbe, SocketReport,
};
pub use title::{TitleMetrics, TitleProbe};
pub use ttfb::{TtfbMetrics, TtfbProbe};

use crate::memory::MemoryReport;

/// A duration or measurement rendered as a fixed two-decimal string.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Fixed2(pub f64);

impl Fixed2 {
    pub fn millis(duration: std::time::Duration) -> Self {
        Self(duration.as_secs_f64() * 1_000.0)
    }
}

impl fmt::Display for Fixed2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Serialize for Fixed2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "probe", rename_all = "camelCase")]
pub enum ProbeMetrics {
    Title(TitleMetrics),
    Render(RenderMetrics),
    Interactive(InteractiveMetrics),
    Ttfb(TtfbMetrics),
    Socket(SocketReport),
    Audit(AuditSummary),
    Memory(MemoryReport),
}

/// Success or failure of one probe against one URL.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Result<ProbeMetrics, String>,
}

impl ProbeResult {
    pub fn success(url: impl Into<String>, metrics: ProbeMetrics) -> Self {
        Self {
            url: url.into(),
            timestamp: Utc::now(),
            outcome: Ok(metrics),
        }
    }

    pub fn failure(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            url: url.into(),
            timestamp: Utc::now(),
            outcome: Err(message.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn metrics(&self) -> Option<&ProbeMetrics> {
        self.outcome.as_ref().ok()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    success: bool,
    url: &'a str,
    #[serde(flatten)]
    metrics: Option<&'a ProbeMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    timestamp: String,
}

impl Serialize for ProbeResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Envelope {
            success: self.is_success(),
            url: &self.url,
            metrics: self.metrics(),
            error_message: self.error_message(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
        .serialize(serializer)
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn stage(&self) -> Stage;

    async fn measure(&self, url: &str) -> ProbeResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_flattens_metrics() {
        let result = ProbeResult::success(
            "https://example.test/",
            ProbeMetrics::Title(TitleMetrics {
                title: "Example".into(),
                time_to_title: Fixed2(12.344),
            }),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["probe"], "title");
        assert_eq!(value["title"], "Example");
        assert_eq!(value["timeToTitle"], "12.34");
        assert!(value.get("errorMessage").is_none());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn failure_envelope_carries_message_only() {
        let result = ProbeResult::failure("https://example.test/", "connection refused");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["errorMessage"], "connection refused");
        assert!(value.get("probe").is_none());
    }
}
