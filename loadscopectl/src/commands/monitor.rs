use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use clap::Args;
use loadscope_core::pipeline::Stage;
use loadscope_core::probe::{ProbeResult, ProbeSet};
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::{render, AppContext, AppError, DisplayFallback, OutputFormat, Result};

use super::measure::{required_url, summary_line, ProbeKind};

#[derive(Args, Debug)]
pub struct MonitorArgs {
    #[arg(value_enum)]
    pub kind: ProbeKind,
    /// Page to measure
    pub url: String,
    /// Seconds between measurements
    #[arg(long, default_value_t = 60)]
    pub interval: u64,
    /// Stop after this many measurements; runs until interrupted otherwise
    #[arg(long)]
    pub iterations: Option<u32>,
}

pub(crate) async fn monitor(
    context: &AppContext,
    args: &MonitorArgs,
    format: OutputFormat,
) -> Result<()> {
    let url = required_url(&args.url)?;
    let probes = ProbeSet::from_config(&context.config)?;
    let stage = args.kind.stage();
    let probe = probes
        .get(stage)
        .ok_or_else(|| AppError::MissingProbe(stage.to_string()))?;

    let mut ticker = interval(Duration::from_secs(args.interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = MonitorSummary::new(url, stage);
    info!(url = %url, stage = %stage, interval_s = args.interval, "monitor started");

    loop {
        if args
            .iterations
            .is_some_and(|limit| summary.iterations >= limit)
        {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!(url = %url, "monitor interrupted");
                break;
            }
        }
        let result = probe.measure(url).await;
        summary.record(&result);
        print_iteration(&result, summary.iterations, format)?;
    }

    render(&summary, format)
}

fn print_iteration(result: &ProbeResult, iteration: u32, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!(
            "{} #{iteration} {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            summary_line(result)
        ),
        OutputFormat::Json => println!("{}", serde_json::to_string(result)?),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSummary {
    pub url: String,
    pub stage: Stage,
    pub iterations: u32,
    pub successes: u32,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MonitorSummary {
    pub fn new(url: &str, stage: Stage) -> Self {
        Self {
            url: url.to_string(),
            stage,
            iterations: 0,
            successes: 0,
            failures: 0,
            last_error: None,
        }
    }

    pub fn record(&mut self, result: &ProbeResult) {
        self.iterations += 1;
        match result.error_message() {
            None => self.successes += 1,
            Some(message) => {
                self.failures += 1;
                self.last_error = Some(message.to_string());
            }
        }
    }
}

impl DisplayFallback for MonitorSummary {
    fn display(&self) -> String {
        let mut text = format!(
            "{stage} for {url}: {ok}/{total} succeeded",
            stage = self.stage,
            url = self.url,
            ok = self.successes,
            total = self.iterations
        );
        if let Some(error) = &self.last_error {
            text.push_str(&format!("\nlast error: {error}"));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_failures_and_keeps_last_error() {
        let mut summary = MonitorSummary::new("https://example.test/", Stage::Ttfb);
        summary.record(&ProbeResult::failure("https://example.test/", "refused"));
        summary.record(&ProbeResult::failure("https://example.test/", "reset"));
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.last_error.as_deref(), Some("reset"));
        assert_eq!(
            summary.display(),
            "ttfb for https://example.test/: 0/2 succeeded\nlast error: reset"
        );
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["lastError"], "reset");
        assert_eq!(value["stage"], "ttfb");
    }
}
