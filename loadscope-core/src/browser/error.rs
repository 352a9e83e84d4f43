use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("page is navigating")]
    Navigating,
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("network capture error: {0}")]
    Network(String),
    #[error("audit engine failure: {0}")]
    Audit(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    /// Transient failure caused by a snapshot racing a document replacement.
    pub fn is_navigating(&self) -> bool {
        matches!(self, BrowserError::Navigating)
    }

    /// Classifies a raw CDP error message, folding context-destroyed races
    /// into [`BrowserError::Navigating`].
    pub fn from_cdp_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("execution context was destroyed")
            || lower.contains("cannot find context with specified id")
            || lower.contains("inspected target navigated")
            || lower.contains("page is navigating")
        {
            BrowserError::Navigating
        } else {
            BrowserError::Evaluation(message)
        }
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for BrowserError {
    fn from(err: serde_json::Error) -> Self {
        BrowserError::Evaluation(format!("unexpected payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_destroyed_is_navigating() {
        let err = BrowserError::from_cdp_message(
            "Execution context was destroyed, most likely because of a navigation.",
        );
        assert!(err.is_navigating());
        let err = BrowserError::from_cdp_message("ReferenceError: foo is not defined");
        assert!(matches!(err, BrowserError::Evaluation(_)));
    }
}
