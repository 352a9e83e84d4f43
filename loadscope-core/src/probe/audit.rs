use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult};
use crate::config::AuditSection;
use crate::pipeline::Stage;

use super::{Probe, ProbeMetrics, ProbeResult};

/// Settings handed to an audit engine for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRequest {
    pub url: String,
    pub categories: Vec<String>,
    pub form_factor: String,
    pub rtt_ms: u32,
    pub throughput_kbps: u32,
    pub cpu_slowdown_multiplier: f64,
    pub chrome_flags: Vec<String>,
}

impl AuditRequest {
    pub fn from_section(url: &str, section: &AuditSection) -> Self {
        Self {
            url: url.to_string(),
            categories: section.categories.clone(),
            form_factor: section.form_factor.clone(),
            rtt_ms: section.rtt_ms,
            throughput_kbps: section.throughput_kbps,
            cpu_slowdown_multiplier: section.cpu_slowdown_multiplier,
            chrome_flags: section.chrome_flags.clone(),
        }
    }
}

/// External auditor producing a Lighthouse-style JSON report.
#[async_trait]
pub trait AuditEngine: Send + Sync {
    async fn run(&self, request: &AuditRequest) -> BrowserResult<Value>;
}

/// Runs the `lighthouse` command line tool and reads its JSON report from
/// stdout.
#[derive(Debug, Clone)]
pub struct LighthouseCli {
    binary: String,
    timeout: Duration,
}

impl LighthouseCli {
    pub fn new(section: &AuditSection) -> Self {
        Self {
            binary: section.binary.clone(),
            timeout: Duration::from_secs(section.timeout_seconds),
        }
    }

    pub fn arguments(request: &AuditRequest) -> Vec<String> {
        let mut args = vec![
            request.url.clone(),
            "--output=json".to_string(),
            "--output-path=stdout".to_string(),
            "--quiet".to_string(),
            format!("--only-categories={}", request.categories.join(",")),
        ];
        if request.form_factor == "desktop" {
            args.push("--preset=desktop".to_string());
        } else {
            args.push(format!("--form-factor={}", request.form_factor));
        }
        args.push(format!("--throttling.rttMs={}", request.rtt_ms));
        args.push(format!("--throttling.throughputKbps={}", request.throughput_kbps));
        args.push(format!(
            "--throttling.cpuSlowdownMultiplier={}",
            request.cpu_slowdown_multiplier
        ));
        if !request.chrome_flags.is_empty() {
            args.push(format!("--chrome-flags={}", request.chrome_flags.join(" ")));
        }
        args
    }
}

#[async_trait]
impl AuditEngine for LighthouseCli {
    async fn run(&self, request: &AuditRequest) -> BrowserResult<Value> {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true).args(Self::arguments(request));
        debug!(binary = %self.binary, url = %request.url, "starting audit engine");

        match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(serde_json::from_slice(&output.stdout).map_err(|err| {
                    BrowserError::Audit(format!("unreadable report: {err}"))
                })?)
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(BrowserError::Audit(format!(
                    "{} exited with {}: {}",
                    self.binary,
                    output.status,
                    stderr.trim()
                )))
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => Err(BrowserError::Audit(
                format!("{} not found on PATH", self.binary),
            )),
            Ok(Err(err)) => Err(BrowserError::Io(err)),
            Err(_) => Err(BrowserError::Timeout(format!(
                "audit engine after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    final_url: Option<String>,
    final_displayed_url: Option<String>,
    fetch_time: Option<String>,
    #[serde(default)]
    categories: HashMap<String, ReportCategory>,
    #[serde(default)]
    audits: HashMap<String, ReportAudit>,
    #[serde(default)]
    run_warnings: Vec<String>,
    environment: Option<ReportEnvironment>,
    config_settings: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReportCategory {
    score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportAudit {
    title: Option<String>,
    description: Option<String>,
    score: Option<f64>,
    numeric_value: Option<f64>,
    display_value: Option<String>,
    details: Option<Value>,
}

impl ReportAudit {
    fn metric(&self) -> AuditMetric {
        AuditMetric {
            score: self.score,
            numeric_value: self.numeric_value,
            display_value: self.display_value.clone(),
        }
    }

    fn detail_type(&self) -> Option<&str> {
        self.details.as_ref()?.get("type")?.as_str()
    }

    fn items(&self) -> Vec<Value> {
        self.details
            .as_ref()
            .and_then(|details| details.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEnvironment {
    pub network_user_agent: Option<String>,
    pub host_user_agent: Option<String>,
    pub benchmark_index: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMetric {
    pub score: Option<f64>,
    pub numeric_value: Option<f64>,
    pub display_value: Option<String>,
}

/// Category scores on a 0-100 scale.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditScores {
    pub performance: Option<u32>,
    pub accessibility: Option<u32>,
    pub best_practices: Option<u32>,
    pub seo: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetrics {
    pub lcp: Option<AuditMetric>,
    pub fid: Option<AuditMetric>,
    pub cls: Option<AuditMetric>,
    pub fcp: Option<AuditMetric>,
    pub si: Option<AuditMetric>,
    pub tti: Option<AuditMetric>,
    pub tbt: Option<AuditMetric>,
    pub time_to_first_byte: Option<AuditMetric>,
    pub first_meaningful_paint: Option<AuditMetric>,
    pub load_time: Option<AuditMetric>,
    pub main_thread_work: Vec<Value>,
    pub bootup_time: Vec<Value>,
    pub resource_summary: Vec<Value>,
    pub layout_shift_elements: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditOpportunity {
    pub title: Option<String>,
    pub description: Option<String>,
    pub score: Option<f64>,
    pub numeric_value: Option<f64>,
    pub display_value: Option<String>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub final_url: Option<String>,
    pub fetch_time: Option<String>,
    pub scores: AuditScores,
    pub metrics: KeyMetrics,
    pub opportunities: BTreeMap<String, AuditOpportunity>,
    pub run_warnings: Vec<String>,
    pub environment: Option<ReportEnvironment>,
    /// Settings the engine actually ran with, throttling included.
    pub config_settings: Option<Value>,
}

/// Maps a raw Lighthouse result into the summary shape.
pub fn summarize_report(raw: Value) -> BrowserResult<AuditSummary> {
    let report: Report = serde_json::from_value(raw)
        .map_err(|err| BrowserError::Audit(format!("unexpected report shape: {err}")))?;

    let score = |category: &str| {
        report
            .categories
            .get(category)
            .and_then(|c| c.score)
            .map(|s| (s * 100.0).round() as u32)
    };
    let metric = |audit: &str| report.audits.get(audit).map(ReportAudit::metric);
    let items = |audit: &str| {
        report
            .audits
            .get(audit)
            .map(ReportAudit::items)
            .unwrap_or_default()
    };

    let scores = AuditScores {
        performance: score("performance"),
        accessibility: score("accessibility"),
        best_practices: score("best-practices"),
        seo: score("seo"),
    };
    let metrics = KeyMetrics {
        lcp: metric("largest-contentful-paint"),
        fid: metric("max-potential-fid"),
        cls: metric("cumulative-layout-shift"),
        fcp: metric("first-contentful-paint"),
        si: metric("speed-index"),
        tti: metric("interactive"),
        tbt: metric("total-blocking-time"),
        time_to_first_byte: metric("server-response-time"),
        first_meaningful_paint: metric("first-meaningful-paint"),
        load_time: metric("load-fast-enough-for-pwa"),
        main_thread_work: items("mainthread-work-breakdown"),
        bootup_time: items("bootup-time"),
        resource_summary: items("resource-summary"),
        layout_shift_elements: items("layout-shift-elements"),
    };
    let opportunities = report
        .audits
        .iter()
        .filter(|(_, audit)| audit.detail_type() == Some("opportunity"))
        .map(|(key, audit)| {
            (
                key.clone(),
                AuditOpportunity {
                    title: audit.title.clone(),
                    description: audit.description.clone(),
                    score: audit.score,
                    numeric_value: audit.numeric_value,
                    display_value: audit.display_value.clone(),
                    details: audit.details.clone(),
                },
            )
        })
        .collect();

    Ok(AuditSummary {
        final_url: report.final_url.or(report.final_displayed_url),
        fetch_time: report.fetch_time,
        scores,
        metrics,
        opportunities,
        run_warnings: report.run_warnings,
        environment: report.environment,
        config_settings: report.config_settings,
    })
}

pub struct AuditProbe {
    engine: Arc<dyn AuditEngine>,
    section: AuditSection,
}

impl AuditProbe {
    pub fn new(engine: Arc<dyn AuditEngine>, section: AuditSection) -> Self {
        Self { engine, section }
    }

    async fn run(&self, url: &str) -> BrowserResult<AuditSummary> {
        let request = AuditRequest::from_section(url, &self.section);
        let raw = self.engine.run(&request).await?;
        summarize_report(raw)
    }
}

#[async_trait]
impl Probe for AuditProbe {
    fn stage(&self) -> Stage {
        Stage::AuditAnalysis
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        match self.run(url).await {
            Ok(summary) => {
                info!(
                    url = %url,
                    performance = ?summary.scores.performance,
                    warnings = summary.run_warnings.len(),
                    "audit finished"
                );
                ProbeResult::success(url, ProbeMetrics::Audit(summary))
            }
            Err(err) => {
                warn!(url = %url, error = %err, "audit probe failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_profile_arguments() {
        let request = AuditRequest::from_section("https://example.test/", &AuditSection::default());
        let args = LighthouseCli::arguments(&request);
        assert_eq!(args[0], "https://example.test/");
        assert!(args
            .iter()
            .any(|a| a == "--only-categories=performance,accessibility,best-practices,seo"));
        assert!(args.iter().any(|a| a == "--preset=desktop"));
        assert!(args.iter().any(|a| a == "--throttling.rttMs=40"));
        assert!(args.iter().any(|a| a == "--throttling.throughputKbps=10240"));
        assert!(args.iter().any(|a| a == "--throttling.cpuSlowdownMultiplier=1"));
    }

    #[test]
    fn unreadable_report_is_an_audit_error() {
        let err = summarize_report(serde_json::json!({"categories": 3})).unwrap_err();
        assert!(matches!(err, BrowserError::Audit(_)));
    }
}
