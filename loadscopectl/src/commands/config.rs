use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Subcommand;

use crate::{AppContext, HealthEntry};

const CHROMIUM_CANDIDATES: [&str; 4] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validates the configuration and looks for the external tools it names
    Check,
}

pub(crate) fn check(context: &AppContext) -> Vec<HealthEntry> {
    let config = &context.config;
    let mut results = Vec::new();

    results.push(if context.config_loaded {
        HealthEntry::ok("config", context.config_path.display().to_string())
    } else {
        HealthEntry::warn(
            "config",
            format!("{} not found; defaults in use", context.config_path.display()),
        )
    });

    results.push(match &config.chromium.executable_path {
        Some(path) if path.is_file() => HealthEntry::ok("chromium", path.display().to_string()),
        Some(path) => HealthEntry::error("chromium", format!("{} missing", path.display())),
        None => match CHROMIUM_CANDIDATES.iter().find_map(|name| find_executable(name)) {
            Some(path) => HealthEntry::ok("chromium", path.display().to_string()),
            None => HealthEntry::warn(
                "chromium",
                "no executable configured or on PATH; relying on auto-detection",
            ),
        },
    });

    results.push(match find_executable(&config.audit.binary) {
        Some(path) => HealthEntry::ok("lighthouse", path.display().to_string()),
        None => HealthEntry::warn(
            "lighthouse",
            format!("{} not found; the audit stage will fail", config.audit.binary),
        ),
    });

    results.push(check_bind(&config.server.bind));
    results
}

fn check_bind(bind: &str) -> HealthEntry {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => HealthEntry::ok("server.bind", addr.to_string()),
        Err(err) => HealthEntry::error("server.bind", format!("{bind}: {err}")),
    }
}

/// Resolves a bare program name against PATH; paths are checked as given.
fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CheckStatus;
    use tempfile::TempDir;

    #[test]
    fn bind_address_must_parse() {
        assert!(matches!(check_bind("127.0.0.1:5000").status, CheckStatus::Ok));
        assert!(matches!(check_bind("localhost").status, CheckStatus::Error));
    }

    #[test]
    fn explicit_paths_are_checked_directly() {
        let temp = TempDir::new().unwrap();
        let tool = temp.path().join("lighthouse");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        assert_eq!(find_executable(tool.to_str().unwrap()), Some(tool.clone()));
        let missing = temp.path().join("missing");
        assert_eq!(find_executable(missing.to_str().unwrap()), None);
    }
}
