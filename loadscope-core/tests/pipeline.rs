use std::sync::Arc;
use std::time::Duration;

use loadscope_core::config::{AuditSection, InteractiveSection, SamplerSection, SocketSection};
use loadscope_core::memory::SampleCollector;
use loadscope_core::pipeline::{parse_event_stream, PipelineOrchestrator, Stage, WriterSink};
use loadscope_core::probe::{
    AuditProbe, Fixed2, InteractiveProbe, MemoryProbe, Probe, ProbeMetrics, RenderProbe,
    SocketProbe, TitleMetrics, TitleProbe, TtfbProbe,
};
use loadscope_core::system::ProcessMeter;
use loadscope_core::test_framework::{
    markers, memory_snapshot, sample_lighthouse_report, RecordingSink, ScriptedSessionFactory,
    SessionScript, StaticAuditEngine, StaticFetcher, StubOutcome, StubProbe,
};
use loadscope_core::wait::{NavigationWaiter, WaitOptions};
use serde_json::json;

const PAGE: &str = "https://example.test/";

fn waiter() -> NavigationWaiter {
    NavigationWaiter::new(WaitOptions {
        quiet_threshold: Duration::from_millis(500),
        max_wait: Duration::from_secs(5),
        pause_after_load: Duration::from_millis(200),
    })
}

fn healthy_page() -> ScriptedSessionFactory {
    ScriptedSessionFactory::new(
        SessionScript::new()
            .load_at(100)
            .on_evaluate(markers::MEMORY, |_| Ok(memory_snapshot(8.0, 16.0, 64.0, 30)))
            .on_evaluate_value(markers::LONG_TASK_POLL, json!({"now": 9000.0, "lastLongTask": 0.0})),
    )
}

fn stub(stage: Stage) -> Arc<StubProbe> {
    Arc::new(StubProbe::new(
        stage,
        StubOutcome::Succeed(ProbeMetrics::Title(TitleMetrics {
            title: format!("{stage}"),
            time_to_title: Fixed2(1.0),
        })),
    ))
}

#[tokio::test(start_paused = true)]
async fn failing_render_does_not_stop_later_stages() {
    let page = Arc::new(healthy_page());
    let broken = Arc::new(ScriptedSessionFactory::failing("net::ERR_CONNECTION_REFUSED"));
    let fetcher = Arc::new(StaticFetcher::new("<title>Stages</title>"));
    let collector = SampleCollector::new(
        page.clone(),
        waiter(),
        &SamplerSection::default(),
        Arc::new(ProcessMeter::new()),
    );
    let probes: Vec<Arc<dyn Probe>> = vec![
        Arc::new(MemoryProbe::new(collector)),
        Arc::new(TitleProbe::new(fetcher.clone())),
        Arc::new(RenderProbe::new(broken, waiter())),
        Arc::new(InteractiveProbe::new(page.clone(), waiter(), &InteractiveSection::default())),
        Arc::new(TtfbProbe::new(fetcher)),
        Arc::new(SocketProbe::new(page, &SocketSection::default())),
        Arc::new(AuditProbe::new(
            Arc::new(StaticAuditEngine::new(sample_lighthouse_report())),
            AuditSection::default(),
        )),
    ];
    let mut sink = RecordingSink::new();

    let run = PipelineOrchestrator::new(probes).run(PAGE, &mut sink).await;

    assert_eq!(
        sink.stages(),
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
    for event in &sink.events[..7] {
        let expected = event.stage != "renderTime";
        assert_eq!(event.data["success"], expected, "stage {}", event.stage);
    }
    assert!(sink.events[1].data["errorMessage"]
        .as_str()
        .unwrap()
        .contains("ERR_CONNECTION_REFUSED"));

    let complete = &sink.events[7].data;
    assert_eq!(complete["success"], true);
    assert_eq!(complete["url"], PAGE);
    assert_eq!(complete["results"]["renderTime"]["success"], false);
    assert_eq!(complete["results"]["heapSeries"]["success"], true);
    assert_eq!(sink.terminal_count(), 1);
    assert_eq!(sink.closes, 1);
    assert!(run.is_complete());
    assert_eq!(run.stage_results.len(), 7);
}

#[tokio::test]
async fn panicking_stage_ends_run_with_one_error_event() {
    let after = stub(Stage::Ttfb);
    let probes: Vec<Arc<dyn Probe>> = vec![
        stub(Stage::TitleTime),
        Arc::new(StubProbe::new(
            Stage::RenderTime,
            StubOutcome::Panic("renderer exploded".into()),
        )),
        after.clone(),
    ];
    let mut sink = RecordingSink::new();

    let run = PipelineOrchestrator::new(probes)
        .with_error_trace(true)
        .run(PAGE, &mut sink)
        .await;

    assert_eq!(sink.stages(), vec!["titleTime", "error"]);
    let error = &sink.events[1].data;
    assert_eq!(error["stage"], "renderTime");
    assert!(error["message"].as_str().unwrap().contains("renderer exploded"));
    assert!(error["trace"].is_string());
    assert_eq!(sink.terminal_count(), 1);
    assert_eq!(sink.closes, 1);
    assert_eq!(after.calls(), 0);
    assert_eq!(run.current_stage, Stage::Error);
    assert!(!run.is_complete());
    assert!(run.failure.is_some());
}

#[tokio::test]
async fn failed_probe_result_is_not_a_pipeline_error() {
    let probes: Vec<Arc<dyn Probe>> = vec![
        Arc::new(StubProbe::new(
            Stage::TitleTime,
            StubOutcome::Fail("dns lookup failed".into()),
        )),
        stub(Stage::RenderTime),
    ];
    let mut sink = RecordingSink::new();

    let run = PipelineOrchestrator::new(probes).run(PAGE, &mut sink).await;

    assert_eq!(sink.stages(), vec!["titleTime", "renderTime", "complete"]);
    assert_eq!(sink.events[0].data["success"], false);
    assert_eq!(sink.events[0].data["errorMessage"], "dns lookup failed");
    assert!(run.is_complete());
    assert!(run.failure.is_none());
}

#[tokio::test]
async fn disconnected_client_stops_the_run() {
    let last = stub(Stage::HeapSeries);
    let probes: Vec<Arc<dyn Probe>> = vec![
        stub(Stage::TitleTime),
        stub(Stage::RenderTime),
        stub(Stage::Ttfb),
        last.clone(),
    ];
    let mut sink = RecordingSink::disconnecting_after(2);

    let run = PipelineOrchestrator::new(probes).run(PAGE, &mut sink).await;

    assert_eq!(sink.stages(), vec!["titleTime", "renderTime"]);
    assert_eq!(sink.terminal_count(), 0);
    assert_eq!(sink.closes, 1);
    assert_eq!(last.calls(), 0);
    assert_eq!(run.current_stage, Stage::Error);
    assert!(run.failure.unwrap().contains("receiver went away"));
}

#[tokio::test]
async fn probes_run_in_stage_order_regardless_of_registration() {
    let probes: Vec<Arc<dyn Probe>> = vec![
        stub(Stage::HeapSeries),
        stub(Stage::AuditAnalysis),
        stub(Stage::TitleTime),
    ];
    let mut sink = RecordingSink::new();

    PipelineOrchestrator::new(probes).run(PAGE, &mut sink).await;

    assert_eq!(
        sink.stages(),
        vec!["titleTime", "auditAnalysis", "heapSeries", "complete"]
    );
}

#[tokio::test]
async fn event_stream_round_trips_through_a_writer() {
    let probes: Vec<Arc<dyn Probe>> = Stage::PROBES
        .iter()
        .map(|stage| stub(*stage) as Arc<dyn Probe>)
        .collect();
    let mut sink = WriterSink::new(Vec::new());

    PipelineOrchestrator::new(probes).run(PAGE, &mut sink).await;

    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert!(text.starts_with("data: {"));
    let events = parse_event_stream(&text).unwrap();
    assert_eq!(events.len(), 8);
    let complete = events.last().unwrap();
    assert!(complete.is_terminal());
    let results = complete.data["results"].as_object().unwrap();
    for stage in Stage::PROBES {
        assert_eq!(results[stage.as_str()]["success"], true, "{stage}");
    }
}
