//! CLI argument definitions for the Fathom replay tool.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use fathom_core::config::LoadingSpeed;

/// Fathom - replays a recorded research-answer stream and shows how it reconciles.
#[derive(Parser, Debug)]
#[command(name = "fathom", version, about)]
pub struct CliArgs {
    /// JSON-lines transcript of transport pushes. Reads stdin when omitted or `-`.
    pub transcript: Option<PathBuf>,

    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Step cycling speed (slow, normal, fast).
    #[arg(short = 's', long = "speed")]
    pub speed: Option<LoadingSpeed>,

    /// Pause between transcript lines, in milliseconds.
    #[arg(long = "delay-ms", default_value_t = 0)]
    pub delay_ms: u64,

    /// Print the final turns as JSON instead of text.
    #[arg(long = "json")]
    pub json: bool,

    /// Print every turn event as a JSON line while replaying.
    #[arg(long = "events")]
    pub events: bool,

    /// Export the last turn after replay.
    #[arg(long = "export", value_enum)]
    pub export: Option<ExportFormat>,

    /// Write the effective configuration to the config path and exit.
    #[arg(long = "write-config")]
    pub write_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Markdown,
    Json,
    Citations,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > FATHOM_CONFIG env var > platform default (~/.fathom/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("FATHOM_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }

    /// Resolve the step cycling speed. Env overrides are already folded into `config_speed`.
    pub fn resolve_speed(&self, config_speed: LoadingSpeed) -> LoadingSpeed {
        self.speed.unwrap_or(config_speed)
    }

    /// Transcript path, or `None` for stdin.
    pub fn transcript_path(&self) -> Option<&PathBuf> {
        self.transcript
            .as_ref()
            .filter(|p| p.as_os_str() != "-")
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".fathom").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".fathom").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let args = CliArgs::parse_from(["fathom"]);
        assert!(args.transcript_path().is_none());
        assert_eq!(args.delay_ms, 0);
        assert!(!args.json);
    }

    #[test]
    fn test_stdin_dash() {
        let args = CliArgs::parse_from(["fathom", "-"]);
        assert!(args.transcript_path().is_none());
    }

    #[test]
    fn test_explicit_config_wins() {
        let args = CliArgs::parse_from(["fathom", "--config", "/tmp/x.toml", "run.jsonl"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/x.toml"));
        assert_eq!(args.transcript_path(), Some(&PathBuf::from("run.jsonl")));
    }

    #[test]
    fn test_speed_and_log_level_priority() {
        let args = CliArgs::parse_from(["fathom", "--speed", "fast", "-l", "debug"]);
        assert_eq!(args.resolve_speed(LoadingSpeed::Slow), LoadingSpeed::Fast);
        assert_eq!(args.resolve_log_level("info"), "debug");

        let args = CliArgs::parse_from(["fathom"]);
        assert_eq!(args.resolve_speed(LoadingSpeed::Slow), LoadingSpeed::Slow);
        assert_eq!(args.resolve_log_level("warn"), "warn");
    }

    #[test]
    fn test_export_format() {
        let args = CliArgs::parse_from(["fathom", "--export", "citations"]);
        assert_eq!(args.export, Some(ExportFormat::Citations));
    }
}
