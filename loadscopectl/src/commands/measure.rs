use clap::{Args, ValueEnum};
use loadscope_core::pipeline::{PipelineOrchestrator, PipelineRun, Stage, WriterSink};
use loadscope_core::probe::{ProbeMetrics, ProbeResult, ProbeSet};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::{render, AppContext, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Page to measure
    pub url: String,
    /// Write `data:` events to stdout as each stage finishes
    #[arg(long)]
    pub stream: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[arg(value_enum)]
    pub kind: ProbeKind,
    /// Page to measure
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeKind {
    Title,
    Render,
    Interactive,
    Ttfb,
    Socket,
    Audit,
    Memory,
}

impl ProbeKind {
    pub fn stage(self) -> Stage {
        match self {
            ProbeKind::Title => Stage::TitleTime,
            ProbeKind::Render => Stage::RenderTime,
            ProbeKind::Interactive => Stage::InteractiveTime,
            ProbeKind::Ttfb => Stage::Ttfb,
            ProbeKind::Socket => Stage::SocketAnalysis,
            ProbeKind::Audit => Stage::AuditAnalysis,
            ProbeKind::Memory => Stage::HeapSeries,
        }
    }
}

pub(crate) async fn run_pipeline(
    context: &AppContext,
    args: &RunArgs,
    format: OutputFormat,
) -> Result<()> {
    let url = required_url(&args.url)?;
    let probes = ProbeSet::from_config(&context.config)?;
    let orchestrator = PipelineOrchestrator::from_set(&probes)
        .with_error_trace(context.config.server.include_error_trace);
    info!(url = %url, stream = args.stream, "running measurement pipeline");

    let run = if args.stream {
        let mut sink = WriterSink::new(tokio::io::stdout());
        orchestrator.run(url, &mut sink).await
    } else {
        let mut sink = WriterSink::new(tokio::io::sink());
        let run = orchestrator.run(url, &mut sink).await;
        render(&RunSummary::from_run(&run)?, format)?;
        run
    };

    match run.failure {
        Some(message) => Err(AppError::Pipeline(message)),
        None => Ok(()),
    }
}

pub(crate) async fn run_probe(context: &AppContext, args: &ProbeArgs) -> Result<ProbeOutput> {
    let url = required_url(&args.url)?;
    let probes = ProbeSet::from_config(&context.config)?;
    let stage = args.kind.stage();
    let probe = probes
        .get(stage)
        .ok_or_else(|| AppError::MissingProbe(stage.to_string()))?;
    Ok(ProbeOutput(probe.measure(url).await))
}

/// Trims the target URL, rejecting a blank one before any stage runs.
pub(crate) fn required_url(url: &str) -> Result<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AppError::UrlRequired);
    }
    Ok(url)
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ProbeOutput(pub ProbeResult);

impl DisplayFallback for ProbeOutput {
    fn display(&self) -> String {
        format!("{}: {}", self.0.url, summary_line(&self.0))
    }
}

/// Outcome of `run` when events are not streamed.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub url: String,
    pub stage: Stage,
    pub results: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip)]
    lines: Vec<String>,
}

impl RunSummary {
    pub fn from_run(run: &PipelineRun) -> Result<Self> {
        let results = run
            .results_json()
            .map_err(|err| AppError::Pipeline(err.to_string()))?;
        let lines = run
            .stage_results
            .iter()
            .map(|(stage, result)| format!("{:<16} {}", stage.as_str(), summary_line(result)))
            .collect();
        Ok(Self {
            url: run.url.clone(),
            stage: run.current_stage,
            results,
            failure: run.failure.clone(),
            lines,
        })
    }
}

impl DisplayFallback for RunSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} ({})", self.url, self.stage)];
        lines.extend(self.lines.iter().map(|line| format!("  {line}")));
        if let Some(failure) = &self.failure {
            lines.push(format!("  stopped: {failure}"));
        }
        lines.join("\n")
    }
}

/// One-line human summary of a probe result.
pub(crate) fn summary_line(result: &ProbeResult) -> String {
    match &result.outcome {
        Err(message) => format!("failed: {message}"),
        Ok(metrics) => headline(metrics),
    }
}

fn headline(metrics: &ProbeMetrics) -> String {
    match metrics {
        ProbeMetrics::Title(m) => format!("\"{}\" in {} ms", m.title, m.time_to_title),
        ProbeMetrics::Render(m) => format!(
            "rendered in {} ms, browser CPU {}%{}",
            m.time_to_render,
            m.cpu_usage_percentage,
            if m.timed_out { " (load timed out)" } else { "" }
        ),
        ProbeMetrics::Interactive(m) => format!(
            "interactive after {} ms{}",
            m.time_to_interactive,
            if m.forced { " (forced)" } else { "" }
        ),
        ProbeMetrics::Ttfb(m) => format!("first byte after {} ms (HTTP {})", m.ttfb, m.status),
        ProbeMetrics::Socket(r) => format!(
            "{} connected of {} socket(s)",
            r.total_connections,
            r.connections.len()
        ),
        ProbeMetrics::Audit(s) => match s.scores.performance {
            Some(score) => format!("performance score {score}"),
            None => "no performance score".to_string(),
        },
        ProbeMetrics::Memory(r) => format!(
            "{} sample(s), loaded in {} ms{}",
            r.measurements.len(),
            r.load_time_ms,
            if r.warnings.is_empty() { "" } else { " (redirected)" }
        ),
    }
}
