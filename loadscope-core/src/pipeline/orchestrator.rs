use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::probe::{Probe, ProbeResult, ProbeSet};

use super::sink::{EventSink, ProgressEvent, SinkError};
use super::stage::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage} panicked: {message}")]
    StagePanicked { stage: Stage, message: String },
    #[error("stage {stage} was cancelled")]
    StageCancelled { stage: Stage },
    #[error("result encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event sink failed: {0}")]
    Sink(#[from] SinkError),
    #[error("event for {0} rejected after the terminal event")]
    AfterTerminal(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    fn from_join(stage: Stage, err: JoinError) -> Self {
        if err.is_panic() {
            PipelineError::StagePanicked {
                stage,
                message: panic_message(err.into_panic()),
            }
        } else {
            PipelineError::StageCancelled { stage }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Aggregate state of one pipeline request.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub url: String,
    pub stage_results: BTreeMap<Stage, ProbeResult>,
    pub current_stage: Stage,
    pub terminal: bool,
    pub failure: Option<String>,
}

impl PipelineRun {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stage_results: BTreeMap::new(),
            current_stage: Stage::Idle,
            terminal: false,
            failure: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.terminal && self.current_stage == Stage::Complete
    }

    /// Emits through the sink unless the run is already terminal. A terminal
    /// event marks the run terminal.
    pub async fn emit(
        &mut self,
        sink: &mut dyn EventSink,
        event: ProgressEvent,
    ) -> PipelineResult<()> {
        if self.terminal {
            return Err(PipelineError::AfterTerminal(event.stage));
        }
        let terminal = event.is_terminal();
        sink.emit(&event).await?;
        if terminal {
            self.terminal = true;
        }
        Ok(())
    }

    pub fn results_json(&self) -> PipelineResult<Value> {
        let mut results = Map::new();
        for (stage, result) in &self.stage_results {
            results.insert(stage.to_string(), serde_json::to_value(result)?);
        }
        Ok(Value::Object(results))
    }
}

/// Runs every stage in order for one URL and streams progress to a sink.
pub struct PipelineOrchestrator {
    probes: Vec<Arc<dyn Probe>>,
    include_error_trace: bool,
}

impl PipelineOrchestrator {
    pub fn new(mut probes: Vec<Arc<dyn Probe>>) -> Self {
        probes.sort_by_key(|probe| probe.stage());
        Self {
            probes,
            include_error_trace: false,
        }
    }

    pub fn from_set(set: &ProbeSet) -> Self {
        Self::new(set.ordered())
    }

    pub fn with_error_trace(mut self, include: bool) -> Self {
        self.include_error_trace = include;
        self
    }

    /// Drives the run to `complete` or `error`. The sink is closed exactly
    /// once, after the last event, whichever way the run ended.
    pub async fn run(&self, url: &str, sink: &mut dyn EventSink) -> PipelineRun {
        let mut run = PipelineRun::new(url);
        info!(url = %url, stages = self.probes.len(), "pipeline started");

        if let Err(err) = self.drive(&mut run, sink).await {
            error!(url = %url, stage = %run.current_stage, error = %err, "pipeline failed");
            let failed_stage = run.current_stage;
            run.failure = Some(err.to_string());
            if !matches!(err, PipelineError::Sink(_)) && !run.terminal {
                let mut data = json!({
                    "message": err.to_string(),
                    "stage": failed_stage,
                });
                if self.include_error_trace {
                    data["trace"] = Value::String(format!("{err:?}"));
                }
                if let Err(emit_err) = run.emit(sink, ProgressEvent::new(Stage::Error, data)).await
                {
                    warn!(url = %url, error = %emit_err, "could not deliver error event");
                }
            }
            run.current_stage = Stage::Error;
            run.terminal = true;
        }

        if let Err(err) = sink.close().await {
            warn!(url = %url, error = %err, "event sink close failed");
        }
        info!(
            url = %url,
            stage = %run.current_stage,
            succeeded = run.stage_results.values().filter(|r| r.is_success()).count(),
            "pipeline finished"
        );
        run
    }

    async fn drive(&self, run: &mut PipelineRun, sink: &mut dyn EventSink) -> PipelineResult<()> {
        for probe in &self.probes {
            let stage = probe.stage();
            run.current_stage = stage;
            info!(url = %run.url, stage = %stage, "stage started");

            let result = Self::run_stage(probe.clone(), stage, &run.url).await?;
            if !result.is_success() {
                warn!(
                    url = %run.url,
                    stage = %stage,
                    error = result.error_message().unwrap_or_default(),
                    "stage reported failure"
                );
            }
            let data = serde_json::to_value(&result)?;
            run.stage_results.insert(stage, result);
            run.emit(sink, ProgressEvent::new(stage, data)).await?;
        }

        run.current_stage = Stage::Complete;
        let data = json!({
            "success": true,
            "url": run.url,
            "results": run.results_json()?,
        });
        run.emit(sink, ProgressEvent::new(Stage::Complete, data)).await
    }

    /// Runs one probe on its own task so a panic surfaces as a join error.
    async fn run_stage(probe: Arc<dyn Probe>, stage: Stage, url: &str) -> PipelineResult<ProbeResult> {
        let url = url.to_string();
        tokio::spawn(async move { probe.measure(&url).await })
            .await
            .map_err(|err| PipelineError::from_join(stage, err))
    }
}
