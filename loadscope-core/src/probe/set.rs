use std::sync::Arc;

use crate::browser::{BrowserLauncher, BrowserResult, SessionFactory};
use crate::config::LoadscopeConfig;
use crate::memory::SampleCollector;
use crate::pipeline::Stage;
use crate::system::ProcessMeter;
use crate::wait::{NavigationWaiter, WaitOptions};

use super::audit::{AuditEngine, AuditProbe, LighthouseCli};
use super::fetch::{Fetcher, ReqwestFetcher};
use super::interactive::InteractiveProbe;
use super::memory::MemoryProbe;
use super::render::RenderProbe;
use super::socket::SocketProbe;
use super::title::TitleProbe;
use super::ttfb::TtfbProbe;
use super::Probe;

/// The full set of probes, one per measurement stage, sharing collaborators.
#[derive(Clone)]
pub struct ProbeSet {
    probes: Vec<Arc<dyn Probe>>,
}

impl ProbeSet {
    /// Builds every probe against the given backends.
    pub fn build(
        config: &LoadscopeConfig,
        sessions: Arc<dyn SessionFactory>,
        fetcher: Arc<dyn Fetcher>,
        audit: Arc<dyn AuditEngine>,
    ) -> Self {
        let waiter = NavigationWaiter::new(WaitOptions::from(&config.navigation));
        let collector = SampleCollector::new(
            sessions.clone(),
            waiter.clone(),
            &config.sampler,
            Arc::new(ProcessMeter::new()),
        );
        let probes: Vec<Arc<dyn Probe>> = vec![
            Arc::new(TitleProbe::new(fetcher.clone())),
            Arc::new(RenderProbe::new(sessions.clone(), waiter.clone())),
            Arc::new(InteractiveProbe::new(
                sessions.clone(),
                waiter,
                &config.interactive,
            )),
            Arc::new(TtfbProbe::new(fetcher)),
            Arc::new(SocketProbe::new(sessions, &config.socket)),
            Arc::new(AuditProbe::new(audit, config.audit.clone())),
            Arc::new(MemoryProbe::new(collector)),
        ];
        Self { probes }
    }

    /// Chromium sessions, a reqwest fetcher and the Lighthouse CLI.
    pub fn from_config(config: &LoadscopeConfig) -> BrowserResult<Self> {
        let sessions = Arc::new(BrowserLauncher::new(config.chromium.clone()));
        let fetcher = Arc::new(ReqwestFetcher::new(&config.http)?);
        let audit = Arc::new(LighthouseCli::new(&config.audit));
        Ok(Self::build(config, sessions, fetcher, audit))
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn Probe>> {
        self.probes
            .iter()
            .find(|probe| probe.stage() == stage)
            .cloned()
    }

    /// Probes in stage order.
    pub fn ordered(&self) -> Vec<Arc<dyn Probe>> {
        let mut probes = self.probes.clone();
        probes.sort_by_key(|probe| probe.stage());
        probes
    }
}
