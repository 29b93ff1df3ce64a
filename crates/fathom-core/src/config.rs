use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FathomError, Result};

/// Environment variable overriding the pipeline step labels (pipe-separated).
pub const ENV_LOADING_STEPS: &str = "FATHOM_LOADING_STEPS";
/// Environment variable overriding the step cycling speed.
pub const ENV_LOADING_SPEED: &str = "FATHOM_LOADING_SPEED";

/// Top-level configuration for Fathom.
///
/// Loaded from `~/.fathom/config.toml` by default. Every section falls back to
/// its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FathomConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
}

impl FathomConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FathomConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject tunings the progress heuristic cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.progress.validate()
    }

    /// Apply `FATHOM_LOADING_STEPS` / `FATHOM_LOADING_SPEED` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply loading overrides from an arbitrary lookup. Environment takes
    /// precedence over the file; unusable values are ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_LOADING_STEPS) {
            let steps = parse_step_list(&raw);
            if steps.is_empty() {
                warn!("{} is set but contains no step labels; ignoring", ENV_LOADING_STEPS);
            } else {
                self.progress.steps = steps;
            }
        }
        if let Some(raw) = lookup(ENV_LOADING_SPEED) {
            match raw.parse::<LoadingSpeed>() {
                Ok(speed) => self.progress.speed = speed,
                Err(e) => warn!("{}: {}", ENV_LOADING_SPEED, e),
            }
        }
    }
}

/// Split a pipe-separated step list, dropping blank entries.
pub fn parse_step_list(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Speed of the cosmetic pipeline step cycling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl LoadingSpeed {
    /// Interval between step advances, in milliseconds.
    pub fn cycle_ms(&self) -> u64 {
        match self {
            LoadingSpeed::Slow => 1400,
            LoadingSpeed::Normal => 1000,
            LoadingSpeed::Fast => 700,
        }
    }
}

impl fmt::Display for LoadingSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadingSpeed::Slow => write!(f, "slow"),
            LoadingSpeed::Normal => write!(f, "normal"),
            LoadingSpeed::Fast => write!(f, "fast"),
        }
    }
}

impl FromStr for LoadingSpeed {
    type Err = FathomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow" => Ok(LoadingSpeed::Slow),
            "normal" => Ok(LoadingSpeed::Normal),
            "fast" => Ok(LoadingSpeed::Fast),
            other => Err(FathomError::Config(format!(
                "unknown loading speed '{}', expected slow, normal or fast",
                other
            ))),
        }
    }
}

/// Tuning knobs of the heuristic progress estimate.
///
/// The ETA is a UX approximation: `base + min(cap_extra, len / divisor) + jitter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum estimate in seconds.
    pub base_secs: u32,
    /// Upper bound on the length-derived extra seconds.
    pub cap_extra_secs: u32,
    /// Query characters per extra second.
    pub length_divisor: u32,
    /// Random jitter is drawn from `0..=jitter_max_secs`.
    pub jitter_max_secs: u32,
    /// Ceiling of the progress fraction while the response is in flight.
    pub max_active_fraction: f64,
    /// Progress clock interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Step cycling speed.
    pub speed: LoadingSpeed,
    /// Cosmetic pipeline stage labels.
    pub steps: Vec<String>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            base_secs: 8,
            cap_extra_secs: 10,
            length_divisor: 35,
            jitter_max_secs: 2,
            max_active_fraction: 0.95,
            tick_interval_ms: 1000,
            speed: LoadingSpeed::Normal,
            steps: default_steps(),
        }
    }
}

/// Default pipeline stage labels.
pub fn default_steps() -> Vec<String> {
    [
        "Queuing request",
        "Finding sources",
        "Fetching content",
        "Cross-checking",
        "Composing answer",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ProgressConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_secs == 0 {
            return Err(invalid("progress.base_secs", "must be greater than zero"));
        }
        if self.length_divisor == 0 {
            return Err(invalid("progress.length_divisor", "must be greater than zero"));
        }
        if !(self.max_active_fraction > 0.0 && self.max_active_fraction < 1.0) {
            return Err(invalid(
                "progress.max_active_fraction",
                "must be strictly between 0 and 1",
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("progress.tick_interval_ms", "must be greater than zero"));
        }
        if self.steps.iter().all(|s| s.trim().is_empty()) {
            return Err(invalid("progress.steps", "at least one step label is required"));
        }
        Ok(())
    }

    /// Largest estimate this tuning can produce, in seconds.
    pub fn max_estimate_secs(&self) -> u32 {
        self.base_secs + self.cap_extra_secs + self.jitter_max_secs
    }
}

fn invalid(field: &str, reason: &str) -> FathomError {
    FathomError::InvalidTuning {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Query submission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Maximum query length in characters.
    pub max_query_chars: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_query_chars: 2000,
        }
    }
}
