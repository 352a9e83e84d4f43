//! Readiness signals for a navigating page.

mod idle;
mod navigation;

pub use idle::{wait_for_inflight_idle, NetworkIdleDetector};
pub use navigation::{LoadOutcome, NavigationWaiter, WaitOptions};
