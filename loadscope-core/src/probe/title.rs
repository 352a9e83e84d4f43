use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::browser::{BrowserError, BrowserResult};
use crate::pipeline::Stage;

use super::fetch::Fetcher;
use super::{Fixed2, Probe, ProbeMetrics, ProbeResult};

const MISSING_TITLE: &str = "No title found";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleMetrics {
    pub title: String,
    pub time_to_title: Fixed2,
}

/// Time from dispatching a plain fetch of the document to having parsed its
/// `<title>`.
pub struct TitleProbe {
    fetcher: Arc<dyn Fetcher>,
}

impl TitleProbe {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    async fn run(&self, url: &str) -> BrowserResult<TitleMetrics> {
        let started = Instant::now();
        let html = self.fetcher.fetch_text(url).await?;
        let title = extract_title(&html)?;
        let elapsed = started.elapsed();
        Ok(TitleMetrics {
            title: title.unwrap_or_else(|| MISSING_TITLE.to_string()),
            time_to_title: Fixed2::millis(elapsed),
        })
    }
}

fn extract_title(html: &str) -> BrowserResult<Option<String>> {
    let selector = Selector::parse("title")
        .map_err(|err| BrowserError::Unexpected(format!("title selector: {err}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string()))
}

#[async_trait]
impl Probe for TitleProbe {
    fn stage(&self) -> Stage {
        Stage::TitleTime
    }

    async fn measure(&self, url: &str) -> ProbeResult {
        match self.run(url).await {
            Ok(metrics) => {
                info!(url = %url, time_to_title = %metrics.time_to_title, "title measured");
                ProbeResult::success(url, ProbeMetrics::Title(metrics))
            }
            Err(err) => {
                warn!(url = %url, error = %err, "title probe failed");
                ProbeResult::failure(url, err)
            }
        }
    }
}
