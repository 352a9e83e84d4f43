use std::fmt;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use loadscope_core::{load_loadscope_config, LoadscopeConfig};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

mod commands;
pub mod server;

pub use commands::{
    ConfigCommands, MonitorArgs, MonitorSummary, ProbeArgs, ProbeKind, ProbeOutput, RunArgs,
    RunSummary,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] loadscope_core::ConfigError),
    #[error("browser error: {0}")]
    Browser(#[from] loadscope_core::BrowserError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("pipeline ended with an error: {0}")]
    Pipeline(String),
    #[error("{0} configuration check(s) failed")]
    ChecksFailed(usize),
    #[error("URL is required")]
    UrlRequired,
    #[error("no probe registered for {0}")]
    MissingProbe(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Page load measurement control interface", long_about = None)]
pub struct Cli {
    /// Path to loadscope.toml
    #[arg(long, default_value = "configs/loadscope.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs every measurement stage against one URL
    Run(RunArgs),
    /// Runs a single probe
    Probe(ProbeArgs),
    /// Re-runs a probe on an interval
    Monitor(MonitorArgs),
    /// Starts the HTTP measurement server
    Serve(ServeArgs),
    /// Configuration tooling
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind, overriding server.bind
    #[arg(long)]
    pub bind: Option<String>,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => commands::measure::run_pipeline(&context, args, cli.format).await,
        Commands::Probe(args) => {
            let output = commands::measure::run_probe(&context, args).await?;
            render(&output, cli.format)
        }
        Commands::Monitor(args) => commands::monitor::monitor(&context, args, cli.format).await,
        Commands::Serve(args) => server::serve(&context.config, args.bind.as_deref()).await,
        Commands::Config(ConfigCommands::Check) => {
            let report = commands::config::check(&context);
            render(&report, cli.format)?;
            let failed = report
                .iter()
                .filter(|entry| matches!(entry.status, CheckStatus::Error))
                .count();
            if failed > 0 {
                return Err(AppError::ChecksFailed(failed));
            }
            Ok(())
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: LoadscopeConfig,
    config_path: PathBuf,
    config_loaded: bool,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let (config, config_loaded) = if config_path.exists() {
            (load_loadscope_config(&config_path)?, true)
        } else {
            warn!(path = %config_path.display(), "config file not found; using defaults");
            (LoadscopeConfig::default().with_env_overrides(), false)
        };
        Ok(Self {
            config,
            config_path,
            config_loaded,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_for(config: PathBuf, command: Commands) -> Cli {
        Cli {
            config,
            format: OutputFormat::Json,
            command,
        }
    }

    #[test]
    fn cli_parses_monitor_arguments() {
        let cli = Cli::try_parse_from([
            "loadscopectl",
            "--format",
            "json",
            "monitor",
            "ttfb",
            "https://example.test/",
            "--interval",
            "5",
            "--iterations",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Monitor(args) => {
                assert_eq!(args.kind, ProbeKind::Ttfb);
                assert_eq!(args.interval, 5);
                assert_eq!(args.iterations, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_url_is_rejected_before_measuring() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("absent.toml");
        let commands = [
            vec!["loadscopectl", "run", ""],
            vec!["loadscopectl", "probe", "title", "   "],
            vec!["loadscopectl", "monitor", "ttfb", " ", "--iterations", "1"],
        ];
        for args in commands {
            let mut cli = Cli::try_parse_from(args.clone()).unwrap();
            cli.config = config.clone();
            let err = run(cli).await.unwrap_err();
            assert!(matches!(err, AppError::UrlRequired), "{args:?}: {err}");
        }
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let cli = cli_for(
            temp.path().join("absent.toml"),
            Commands::Config(ConfigCommands::Check),
        );
        let context = AppContext::new(&cli).unwrap();
        assert!(!context.config_loaded);
        assert_eq!(context.config.server.bind, "127.0.0.1:5000");
    }

    #[test]
    fn invalid_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("loadscope.toml");
        std::fs::write(&path, "[sampler]\ninterval_ms = 0\n").unwrap();
        let cli = cli_for(path, Commands::Config(ConfigCommands::Check));
        assert!(matches!(AppContext::new(&cli), Err(AppError::Config(_))));
    }

    #[test]
    fn health_entries_render_one_per_line() {
        let entries = vec![
            HealthEntry::ok("config", "configs/loadscope.toml"),
            HealthEntry::error("lighthouse", "not found on PATH"),
        ];
        let text = entries.display();
        assert_eq!(
            text,
            "[OK] config: configs/loadscope.toml\n[ERROR] lighthouse: not found on PATH"
        );
    }
}
