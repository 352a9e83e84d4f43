use std::collections::HashSet;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::browser::TrafficEvent;

/// Debounced network-quiet detection over a traffic stream.
///
/// A single timer is armed for the quiet threshold when the detector starts
/// and re-armed on every request or response event, so a page that never
/// produces traffic still resolves after one threshold. There is no upper
/// bound of its own; callers that need one wrap the wait in a deadline.
pub struct NetworkIdleDetector<S> {
    source: Option<S>,
    quiet: Duration,
    events_seen: usize,
}

impl<S> NetworkIdleDetector<S>
where
    S: Stream<Item = TrafficEvent> + Unpin,
{
    pub fn start(source: S, quiet: Duration) -> Self {
        Self {
            source: Some(source),
            quiet,
            events_seen: 0,
        }
    }

    /// Resolves once no traffic has been observed for the quiet threshold.
    /// Returns the number of traffic events that reset the timer.
    pub async fn wait(mut self) -> usize {
        let timer = sleep(self.quiet);
        tokio::pin!(timer);

        loop {
            let Some(source) = self.source.as_mut() else {
                (&mut timer).await;
                break;
            };
            let mut ended = false;
            tokio::select! {
                () = &mut timer => break,
                event = source.next() => match event {
                    Some(event) if event.resets_quiet_period() => {
                        self.events_seen += 1;
                        timer.as_mut().reset(Instant::now() + self.quiet);
                    }
                    Some(_) => {}
                    None => ended = true,
                },
            }
            if ended {
                trace!("traffic source ended before network idle");
                self.detach();
            }
        }

        self.detach();
        self.events_seen
    }
}

impl<S> NetworkIdleDetector<S> {
    /// Drops the traffic subscription. Returns whether anything was detached;
    /// calling it again is a no-op.
    pub fn detach(&mut self) -> bool {
        self.source.take().is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.source.is_some()
    }
}

impl<S> Drop for NetworkIdleDetector<S> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Waits until no request has been outstanding for `window`, or until `cap`
/// elapses. Returns `true` when the page went idle and `false` on the cap.
pub async fn wait_for_inflight_idle<S>(mut traffic: S, window: Duration, cap: Duration) -> bool
where
    S: Stream<Item = TrafficEvent> + Unpin,
{
    let deadline = sleep(cap);
    let quiet = sleep(window);
    tokio::pin!(deadline);
    tokio::pin!(quiet);

    let mut outstanding: HashSet<String> = HashSet::new();
    let mut ended = false;

    loop {
        tokio::select! {
            biased;
            () = &mut deadline => {
                trace!(outstanding = outstanding.len(), "in-flight idle wait hit its cap");
                return false;
            }
            () = &mut quiet, if outstanding.is_empty() => return true,
            event = traffic.next(), if !ended => match event {
                Some(TrafficEvent::RequestSent { request_id, .. }) => {
                    outstanding.insert(request_id);
                }
                Some(TrafficEvent::ResponseReceived { .. }) => {}
                Some(TrafficEvent::LoadingFinished { request_id })
                | Some(TrafficEvent::LoadingFailed { request_id }) => {
                    if outstanding.remove(&request_id) && outstanding.is_empty() {
                        quiet.as_mut().reset(Instant::now() + window);
                    }
                }
                None => ended = true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test(start_paused = true)]
    async fn silent_source_resolves_after_one_threshold() {
        let started = Instant::now();
        let detector = NetworkIdleDetector::start(stream::pending(), Duration::from_secs(5));
        detector.wait().await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn detach_is_idempotent() {
        let mut detector =
            NetworkIdleDetector::start(stream::empty::<TrafficEvent>(), Duration::from_secs(1));
        assert!(detector.is_attached());
        assert!(detector.detach());
        assert!(!detector.detach());
        assert!(!detector.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn ended_source_still_waits_out_the_timer() {
        let started = Instant::now();
        let detector = NetworkIdleDetector::start(
            stream::empty::<TrafficEvent>(),
            Duration::from_millis(500),
        );
        assert_eq!(detector.wait().await, 0);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_idle_without_requests_uses_window() {
        let started = Instant::now();
        let idle = wait_for_inflight_idle(
            stream::pending(),
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .await;
        assert!(idle);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_idle_caps_on_stuck_request() {
        let started = Instant::now();
        let events = stream::iter(vec![TrafficEvent::RequestSent {
            request_id: "1".into(),
            url: "https://example.test/stream".into(),
            is_navigation: false,
        }])
        .chain(stream::pending());
        let idle = wait_for_inflight_idle(
            Box::pin(events),
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
        .await;
        assert!(!idle);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }
}
