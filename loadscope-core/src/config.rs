use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LoadscopeConfig {
    pub chromium: ChromiumSection,
    pub navigation: NavigationSection,
    pub sampler: SamplerSection,
    pub interactive: InteractiveSection,
    pub socket: SocketSection,
    pub audit: AuditSection,
    pub http: HttpSection,
    pub server: ServerSection,
}

impl LoadscopeConfig {
    /// Applies environment overrides on top of the parsed file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("LOADSCOPE_CHROME") {
            if !path.trim().is_empty() {
                self.chromium.executable_path = Some(PathBuf::from(path.trim()));
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampler.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sampler.interval_ms",
                reason: "tick interval must be positive".into(),
            });
        }
        if self.interactive.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "interactive.poll_interval_ms",
                reason: "poll interval must be positive".into(),
            });
        }
        if self.interactive.hard_cap_ms < self.interactive.quiet_window_ms {
            return Err(ConfigError::Invalid {
                field: "interactive.hard_cap_ms",
                reason: format!(
                    "hard cap {}ms is shorter than the quiet window {}ms",
                    self.interactive.hard_cap_ms, self.interactive.quiet_window_ms
                ),
            });
        }
        if self.chromium.viewport.iter().any(|side| *side == 0) {
            return Err(ConfigError::Invalid {
                field: "chromium.viewport",
                reason: "viewport sides must be positive".into(),
            });
        }
        if self.audit.categories.is_empty() {
            return Err(ConfigError::Invalid {
                field: "audit.categories",
                reason: "at least one audit category is required".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<PathBuf>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub viewport: [u32; 2],
    pub request_timeout_seconds: Option<u64>,
    pub extra_args: Vec<String>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: true,
            viewport: [1280, 720],
            request_timeout_seconds: Some(30),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NavigationSection {
    pub quiet_threshold_ms: u64,
    pub max_wait_ms: u64,
    pub pause_after_load_ms: u64,
}

impl Default for NavigationSection {
    fn default() -> Self {
        Self {
            quiet_threshold_ms: 5_000,
            max_wait_ms: 30_000,
            pause_after_load_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerSection {
    pub interval_ms: u64,
    pub final_sample_attempts: u32,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            final_sample_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InteractiveSection {
    pub quiet_window_ms: u64,
    pub poll_interval_ms: u64,
    pub hard_cap_ms: u64,
}

impl Default for InteractiveSection {
    fn default() -> Self {
        Self {
            quiet_window_ms: 5_000,
            poll_interval_ms: 100,
            hard_cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketSection {
    pub idle_window_ms: u64,
    pub idle_cap_ms: u64,
    pub settle_ms: u64,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            idle_window_ms: 500,
            idle_cap_ms: 30_000,
            settle_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub binary: String,
    pub timeout_seconds: u64,
    pub categories: Vec<String>,
    pub form_factor: String,
    pub rtt_ms: u32,
    pub throughput_kbps: u32,
    pub cpu_slowdown_multiplier: f64,
    pub chrome_flags: Vec<String>,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            binary: "lighthouse".to_string(),
            timeout_seconds: 120,
            categories: vec![
                "performance".to_string(),
                "accessibility".to_string(),
                "best-practices".to_string(),
                "seo".to_string(),
            ],
            form_factor: "desktop".to_string(),
            rtt_ms: 40,
            throughput_kbps: 10_240,
            cpu_slowdown_multiplier: 1.0,
            chrome_flags: vec![
                "--headless".to_string(),
                "--disable-gpu".to_string(),
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: concat!("loadscope/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub include_error_trace: bool,
    pub stream_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            include_error_trace: false,
            stream_buffer: 16,
        }
    }
}

pub fn load_loadscope_config<P: AsRef<Path>>(path: P) -> Result<LoadscopeConfig> {
    let config = load_toml::<LoadscopeConfig, _>(path)?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/loadscope.toml");
        let config = load_toml::<LoadscopeConfig, _>(path).expect("config should parse");
        assert_eq!(config.navigation.quiet_threshold_ms, 5_000);
        assert_eq!(config.sampler.interval_ms, 100);
        assert_eq!(config.audit.categories.len(), 4);
        assert_eq!(config.server.bind, "127.0.0.1:5000");
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[navigation]\nmax_wait_ms = 1000\n").unwrap();
        let config = load_toml::<LoadscopeConfig, _>(&path).unwrap();
        assert_eq!(config.navigation.max_wait_ms, 1_000);
        assert_eq!(config.navigation.quiet_threshold_ms, 5_000);
        assert_eq!(config.chromium.viewport, [1280, 720]);
        assert_eq!(config.audit.rtt_ms, 40);
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        let mut config = LoadscopeConfig::default();
        config.sampler.interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "sampler.interval_ms",
                ..
            })
        ));
        assert!(LoadscopeConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_loadscope_config("/nonexistent/loadscope.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert!(path.ends_with("loadscope.toml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
