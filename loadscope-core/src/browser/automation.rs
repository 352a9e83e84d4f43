use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent, EventResponseReceived, EventWebSocketClosed, EventWebSocketCreated,
    EventWebSocketFrameReceived, EventWebSocketFrameSent, EventWebSocketHandshakeResponseReceived,
    EventWebSocketWillSendHandshakeRequest, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventLoadEventFired, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::performance::EnableParams as PerformanceEnableParams;
use chromiumoxide::cdp::browser_protocol::system_info::GetProcessInfoParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;

use super::error::{BrowserError, BrowserResult};
use super::session::{PageSession, SessionFactory, SocketEvent, TrafficEvent};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Launches one Chromium process per session so that no two probes share
/// browser state.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<ChromiumSection>,
}

impl BrowserLauncher {
    pub fn new(config: ChromiumSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ChromiumSection {
        &self.config
    }

    pub async fn launch(&self) -> BrowserResult<ChromiumSession> {
        let profile_dir = next_profile_dir();
        let chromium_config = self.build_chromium_config(&profile_dir)?;
        info!(
            profile = %profile_dir.display(),
            width = self.config.viewport[0],
            height = self.config.viewport[1],
            headless = self.config.headless,
            "Launching Chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let mut session = ChromiumSession {
            browser,
            page: None,
            handler_task: Some(handler_task),
            profile_dir,
        };
        match session.open_page().await {
            Ok(page) => {
                session.page = Some(page);
                Ok(session)
            }
            Err(err) => {
                session.shutdown().await;
                Err(err)
            }
        }
    }

    fn build_chromium_config(&self, profile_dir: &PathBuf) -> BrowserResult<ChromiumConfig> {
        let [width, height] = self.config.viewport;
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir)
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![
            format!("--window-size={width},{height}"),
            "--enable-precise-memory-info".to_string(),
            "--disable-background-timer-throttling".to_string(),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        args.extend(self.config.extra_args.iter().cloned());

        builder = builder.args(args);
        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait]
impl SessionFactory for BrowserLauncher {
    async fn open(&self) -> BrowserResult<Box<dyn PageSession>> {
        Ok(Box::new(self.launch().await?))
    }
}

fn next_profile_dir() -> PathBuf {
    let ordinal = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("loadscope-{}-{ordinal}", std::process::id()))
}

#[derive(Debug)]
pub struct ChromiumSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    profile_dir: PathBuf,
}

impl ChromiumSession {
    async fn open_page(&self) -> BrowserResult<Page> {
        let page = self
            .browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        page.execute(PerformanceEnableParams::default()).await?;
        Ok(page)
    }

    fn page(&self) -> BrowserResult<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| BrowserError::Unexpected("session page already closed".into()))
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        if let Err(err) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!(error = %err, profile = %self.profile_dir.display(), "profile cleanup skipped");
        }
    }
}

#[async_trait]
impl PageSession for ChromiumSession {
    async fn add_init_script(&self, source: &str) -> BrowserResult<()> {
        let params = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(source)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page()?.evaluate_on_new_document(params).await?;
        Ok(())
    }

    async fn load_events(&self) -> BrowserResult<BoxStream<'static, ()>> {
        let events = self
            .page()?
            .event_listener::<EventLoadEventFired>()
            .await?;
        Ok(events.map(|_| ()).boxed())
    }

    async fn traffic(&self) -> BrowserResult<BoxStream<'static, TrafficEvent>> {
        let page = self.page()?;
        page.execute(NetworkEnableParams::default()).await?;
        let requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await?
            .map(|event| TrafficEvent::RequestSent {
                request_id: event.request_id.inner().clone(),
                url: event.request.url.clone(),
                is_navigation: event.request_id.inner() == event.loader_id.inner()
                    && matches!(event.r#type, Some(ResourceType::Document)),
            })
            .boxed();
        let responses = page
            .event_listener::<EventResponseReceived>()
            .await?
            .map(|event| TrafficEvent::ResponseReceived {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await?
            .map(|event| TrafficEvent::LoadingFinished {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await?
            .map(|event| TrafficEvent::LoadingFailed {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        Ok(stream::select_all([requests, responses, finished, failed]).boxed())
    }

    async fn socket_events(&self) -> BrowserResult<BoxStream<'static, SocketEvent>> {
        let page = self.page()?;
        page.execute(NetworkEnableParams::default()).await?;
        let created = page
            .event_listener::<EventWebSocketCreated>()
            .await?
            .map(|event| SocketEvent::Created {
                request_id: event.request_id.inner().clone(),
                url: event.url.clone(),
            })
            .boxed();
        let handshake = page
            .event_listener::<EventWebSocketWillSendHandshakeRequest>()
            .await?
            .map(|event| SocketEvent::HandshakeRequest {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        let accepted = page
            .event_listener::<EventWebSocketHandshakeResponseReceived>()
            .await?
            .map(|event| SocketEvent::HandshakeResponse {
                request_id: event.request_id.inner().clone(),
                status: event.response.status,
                protocol: serde_json::to_value(&event.response.headers)
                    .ok()
                    .and_then(|headers| header_value(&headers, "sec-websocket-protocol")),
            })
            .boxed();
        let sent = page
            .event_listener::<EventWebSocketFrameSent>()
            .await?
            .map(|event| SocketEvent::FrameSent {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        let received = page
            .event_listener::<EventWebSocketFrameReceived>()
            .await?
            .map(|event| SocketEvent::FrameReceived {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        let closed = page
            .event_listener::<EventWebSocketClosed>()
            .await?
            .map(|event| SocketEvent::Closed {
                request_id: event.request_id.inner().clone(),
            })
            .boxed();
        Ok(stream::select_all([created, handshake, accepted, sent, received, closed]).boxed())
    }

    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let response = self.page()?.execute(params).await?;
        if let Some(error) = response.result.error_text.as_deref() {
            return Err(BrowserError::Navigation(format!("{url}: {error}")));
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> BrowserResult<Value> {
        match self.page()?.evaluate(expression).await {
            Ok(result) => Ok(result.value().cloned().unwrap_or(Value::Null)),
            Err(CdpError::JavascriptException(details)) => {
                Err(BrowserError::from_cdp_message(details.text.clone()))
            }
            Err(err) => Err(BrowserError::from_cdp_message(err.to_string())),
        }
    }

    async fn performance_metrics(&self) -> BrowserResult<HashMap<String, f64>> {
        let metrics = self.page()?.metrics().await?;
        Ok(metrics
            .into_iter()
            .map(|metric| (metric.name, metric.value))
            .collect())
    }

    async fn browser_cpu_seconds(&self) -> BrowserResult<f64> {
        let response = self.browser.execute(GetProcessInfoParams::default()).await?;
        Ok(response
            .result
            .process_info
            .iter()
            .map(|process| process.cpu_time)
            .sum())
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        let mut this = *self;
        if let Some(page) = this.page.take() {
            if let Err(err) = page.close().await {
                debug!(error = %err, "page close failed, closing browser anyway");
            }
        }
        this.shutdown().await;
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    profile = %self.profile_dir.display(),
                    "ChromiumSession dropped without explicit close"
                );
            }
        }
    }
}

fn header_value(headers: &Value, name: &str) -> Option<String> {
    headers.as_object().and_then(|map| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_str())
            .map(str::to_string)
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let headers = serde_json::json!({"Sec-WebSocket-Protocol": "graphql-ws"});
        assert_eq!(
            header_value(&headers, "sec-websocket-protocol").as_deref(),
            Some("graphql-ws")
        );
        assert_eq!(header_value(&headers, "upgrade"), None);
    }

    #[test]
    fn profile_dirs_are_unique() {
        assert_ne!(next_profile_dir(), next_profile_dir());
    }
}
