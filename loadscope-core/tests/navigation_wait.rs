use std::time::Duration;

use futures::StreamExt;
use loadscope_core::browser::TrafficEvent;
use loadscope_core::test_framework::{ScriptedSession, SessionLog, SessionScript};
use loadscope_core::wait::{NavigationWaiter, NetworkIdleDetector, WaitOptions};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

fn request(id: usize) -> TrafficEvent {
    TrafficEvent::RequestSent {
        request_id: format!("req-{id}"),
        url: format!("https://example.test/asset-{id}.js"),
        is_navigation: false,
    }
}

fn waiter(quiet_ms: u64, max_wait_ms: u64, pause_ms: u64) -> NavigationWaiter {
    NavigationWaiter::new(WaitOptions {
        quiet_threshold: Duration::from_millis(quiet_ms),
        max_wait: Duration::from_millis(max_wait_ms),
        pause_after_load: Duration::from_millis(pause_ms),
    })
}

#[tokio::test(start_paused = true)]
async fn idle_resolves_one_threshold_after_last_request() {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for id in 0..4 {
            sleep(Duration::from_millis(700)).await;
            let _ = tx.send(request(id));
        }
        sleep(Duration::from_secs(60)).await;
    });

    let started = Instant::now();
    let resets = NetworkIdleDetector::start(UnboundedReceiverStream::new(rx), Duration::from_secs(5))
        .wait()
        .await;

    assert_eq!(resets, 4);
    assert_eq!(started.elapsed(), Duration::from_millis(2_800 + 5_000));
}

#[tokio::test(start_paused = true)]
async fn finished_events_do_not_extend_quiet_period() {
    let events = futures::stream::iter(vec![TrafficEvent::LoadingFinished {
        request_id: "req-0".into(),
    }])
    .chain(futures::stream::pending());

    let started = Instant::now();
    let resets = NetworkIdleDetector::start(Box::pin(events), Duration::from_millis(500))
        .wait()
        .await;

    assert_eq!(resets, 0);
    assert_eq!(started.elapsed(), Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn missing_load_event_times_out_at_max_wait() {
    let session = ScriptedSession::new(SessionScript::new(), SessionLog::default());

    let started = Instant::now();
    let outcome = waiter(500, 3_000, 100)
        .navigate(&session, "https://example.test/")
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn load_then_quiet_then_pause() {
    let script = SessionScript::new()
        .load_at(1_000)
        .traffic_at(1_200, request(1))
        .traffic_at(2_000, request(2));
    let log = SessionLog::default();
    let session = ScriptedSession::new(script, log.clone());

    let started = Instant::now();
    let outcome = waiter(5_000, 30_000, 1_000)
        .navigate(&session, "https://example.test/")
        .await
        .unwrap();

    assert!(!outcome.timed_out);
    assert_eq!(started.elapsed(), Duration::from_millis(2_000 + 5_000 + 1_000));
    assert_eq!(log.navigations(), vec!["https://example.test/".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn endless_beacons_are_cut_off_at_the_upper_bound() {
    let mut script = SessionScript::new().load_at(100);
    for id in 0..400 {
        script = script.traffic_at(100 + 300 * id as u64, request(id));
    }
    let session = ScriptedSession::new(script, SessionLog::default());
    let waiter = waiter(500, 3_000, 100);

    let started = Instant::now();
    let outcome = waiter
        .navigate(&session, "https://example.test/")
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(started.elapsed(), waiter.options().upper_bound());
    assert_eq!(started.elapsed(), Duration::from_millis(3_600));
}

#[tokio::test(start_paused = true)]
async fn navigation_error_is_returned() {
    let script = SessionScript::new().fail_navigation("net::ERR_NAME_NOT_RESOLVED");
    let session = ScriptedSession::new(script, SessionLog::default());

    let err = waiter(500, 3_000, 100)
        .navigate(&session, "https://missing.test/")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
}

#[test]
fn upper_bound_sums_every_phase() {
    let options = WaitOptions::default();
    assert_eq!(options.upper_bound(), Duration::from_millis(30_000 + 5_000 + 1_000));
}
