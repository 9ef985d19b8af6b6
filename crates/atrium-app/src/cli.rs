//! CLI argument definitions for the atrium service.
//!
//! Uses `clap` with derive macros for argument parsing.
//! Priority resolution: CLI args > `ATRIUM_*` env vars > config file > defaults.

use std::path::PathBuf;

use clap::Parser;

use atrium_core::config::AtriumConfig;

/// Atrium: message aggregation and booking engine for chat-driven scheduling.
#[derive(Parser, Debug)]
#[command(name = "atrium", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Data directory for the SQLite database and the API token.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > ATRIUM_CONFIG env var > ~/.atrium/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        self.resolve_config_path_with(|name| std::env::var(name).ok())
    }

    fn resolve_config_path_with(&self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Some(p) = env("ATRIUM_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Layer env vars and then CLI flags over the loaded file.
    pub fn apply_overrides(&self, config: &mut AtriumConfig) {
        self.apply_overrides_with(config, |name| std::env::var(name).ok());
    }

    fn apply_overrides_with(
        &self,
        config: &mut AtriumConfig,
        env: impl Fn(&str) -> Option<String>,
    ) {
        if let Some(port) = env("ATRIUM_PORT").and_then(|v| v.parse::<u16>().ok()) {
            config.general.port = port;
        }
        if let Some(dir) = env("ATRIUM_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.general.data_dir = dir;
        }
        if let Some(level) = env("ATRIUM_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            config.general.log_level = level;
        }
        if let Some(keys) = env("ATRIUM_AI_KEYS") {
            let keys: Vec<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            if !keys.is_empty() {
                config.ai.api_keys = keys;
            }
        }

        if let Some(port) = self.port {
            config.general.port = port;
        }
        if let Some(ref dir) = self.data_dir {
            config.general.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".atrium").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".atrium").join("config.toml");
    }
    PathBuf::from("config.toml")
}
