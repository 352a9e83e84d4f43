use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use loadscope_core::config::ServerSection;
use loadscope_core::pipeline::{ChannelSink, PipelineOrchestrator, Stage};
use loadscope_core::probe::{ProbeResult, ProbeSet};
use loadscope_core::LoadscopeConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::{AppError, Result};

#[derive(Clone)]
pub struct AppState {
    probes: ProbeSet,
    orchestrator: Arc<PipelineOrchestrator>,
    stream_buffer: usize,
}

impl AppState {
    pub fn new(probes: ProbeSet, server: &ServerSection) -> Self {
        let orchestrator =
            PipelineOrchestrator::from_set(&probes).with_error_trace(server.include_error_trace);
        Self {
            probes,
            orchestrator: Arc::new(orchestrator),
            stream_buffer: server.stream_buffer.max(1),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(api_health))
        .route("/api/measure-stream", post(measure_stream))
        .route("/api/measure-title-time", probe_route(Stage::TitleTime))
        .route("/api/measure-render-time", probe_route(Stage::RenderTime))
        .route(
            "/api/measure-interactive-time",
            probe_route(Stage::InteractiveTime),
        )
        .route("/api/measure-ttfb-simple", probe_route(Stage::Ttfb))
        .route("/api/analyze-sockets", probe_route(Stage::SocketAnalysis))
        .route("/api/analyze", probe_route(Stage::AuditAnalysis))
        .route("/api/track-memory", probe_route(Stage::HeapSeries))
        .route("/api/measure-all-metrics", post(measure_all_metrics))
        .with_state(state)
}

pub async fn serve(config: &LoadscopeConfig, bind_override: Option<&str>) -> Result<()> {
    let bind = bind_override.unwrap_or(config.server.bind.as_str());
    let addr: SocketAddr = bind
        .parse()
        .map_err(|err| AppError::Server(format!("invalid bind address {bind}: {err}")))?;
    let probes = ProbeSet::from_config(config)?;
    let app = router(AppState::new(probes, &config.server));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "measurement server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "failed to listen for shutdown signal");
            }
        })
        .await?;
    info!("measurement server stopped");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn api_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": now() }))
}

async fn measure_stream(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(url) = requested_url(&body) else {
        return url_required();
    };
    let (mut sink, receiver) = ChannelSink::channel(state.stream_buffer);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let run = orchestrator.run(&url, &mut sink).await;
        if let Some(failure) = run.failure {
            info!(url = %run.url, %failure, "streamed run ended early");
        }
    });

    let stream = ReceiverStream::new(receiver).map(Ok::<_, Infallible>);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

fn probe_route(stage: Stage) -> axum::routing::MethodRouter<AppState> {
    post(move |State(state): State<AppState>, body: Bytes| async move {
        measure_one(&state, stage, &body).await
    })
}

async fn measure_one(state: &AppState, stage: Stage, body: &[u8]) -> Response {
    let Some(url) = requested_url(body) else {
        return url_required();
    };
    let result = run_probe(state, stage, &url).await;
    (StatusCode::OK, Json(result)).into_response()
}

async fn measure_all_metrics(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(url) = requested_url(&body) else {
        return url_required();
    };
    let (title, render, interactive) = tokio::join!(
        run_probe(&state, Stage::TitleTime, &url),
        run_probe(&state, Stage::RenderTime, &url),
        run_probe(&state, Stage::InteractiveTime, &url),
    );
    let metrics = json!({
        "titleTiming": title,
        "renderTiming": render,
        "interactiveTiming": interactive,
    });
    Json(json!({
        "success": true,
        "url": url,
        "metrics": metrics,
        "timestamp": now(),
    }))
    .into_response()
}

async fn run_probe(state: &AppState, stage: Stage, url: &str) -> ProbeResult {
    match state.probes.get(stage) {
        Some(probe) => probe.measure(url).await,
        None => ProbeResult::failure(url, format!("no probe registered for {stage}")),
    }
}

/// Reads `url` from a JSON body; anything unparseable counts as missing.
fn requested_url(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let url = value.get("url")?.as_str()?.trim();
    (!url.is_empty()).then(|| url.to_string())
}

fn url_required() -> Response {
    json_error(StatusCode::BAD_REQUEST, "URL is required")
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use loadscope_core::pipeline::parse_event_stream;
    use loadscope_core::test_framework::{
        markers, memory_snapshot, sample_lighthouse_report, ScriptedSessionFactory,
        SessionScript, StaticAuditEngine, StaticFetcher,
    };
    use tower::ServiceExt;

    const PAGE: &str = "https://example.test/";

    fn app() -> Router {
        let config = LoadscopeConfig::default();
        let sessions = Arc::new(ScriptedSessionFactory::new(
            SessionScript::new()
                .load_at(100)
                .on_evaluate(markers::MEMORY, |_| Ok(memory_snapshot(8.0, 16.0, 64.0, 30)))
                .on_evaluate_value(
                    markers::LONG_TASK_POLL,
                    json!({"now": 9000.0, "lastLongTask": 0.0}),
                ),
        ));
        let probes = ProbeSet::build(
            &config,
            sessions,
            Arc::new(StaticFetcher::new("<html><title>Served</title></html>")),
            Arc::new(StaticAuditEngine::new(sample_lighthouse_report())),
        );
        router(AppState::new(probes, &config.server))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");

        let response = app()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn missing_or_blank_url_is_rejected() {
        for body in ["{}", r#"{"url":"   "}"#, "not json"] {
            let response = app()
                .oneshot(post_json("/api/measure-stream", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            let json = body_json(response).await;
            assert_eq!(json["success"], false);
            assert_eq!(json["error"], "URL is required");
        }
    }

    #[tokio::test]
    async fn single_probe_route_returns_probe_result() {
        let response = app()
            .oneshot(post_json(
                "/api/measure-title-time",
                &format!(r#"{{"url":" {PAGE} "}}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["url"], PAGE);
        assert_eq!(json["title"], "Served");
    }

    #[tokio::test(start_paused = true)]
    async fn measure_stream_emits_every_stage() {
        let response = app()
            .oneshot(post_json(
                "/api/measure-stream",
                &format!(r#"{{"url":"{PAGE}"}}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let events = parse_event_stream(std::str::from_utf8(&bytes).unwrap()).unwrap();
        let stages: Vec<&str> = events.iter().map(|event| event.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "titleTime",
                "renderTime",
                "interactiveTime",
                "ttfb",
                "socketAnalysis",
                "auditAnalysis",
                "heapSeries",
                "complete"
            ]
        );
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_metrics_combines_three_probes() {
        let response = app()
            .oneshot(post_json(
                "/api/measure-all-metrics",
                &format!(r#"{{"url":"{PAGE}"}}"#),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["url"], PAGE);
        for key in ["titleTiming", "renderTiming", "interactiveTiming"] {
            assert_eq!(json["metrics"][key]["success"], true, "{key}");
        }
    }
}
