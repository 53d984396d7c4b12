//! Pipeline configuration
//!
//! Precedence, lowest first: built-in defaults, TOML file, `VIDSHRINK_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::model::{BitrateTarget, ContainerFormat, EncoderSettings, Pacing, VideoCodec};
use crate::engine::progress::DEFAULT_CADENCE;
use crate::utils::logging::{LogLevel, LoggingConfig};

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "VIDSHRINK_";

/// Typed pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Progress sampling interval
    pub progress_cadence_ms: u64,
    /// Upper bound on waiting for source metadata
    pub metadata_timeout_ms: u64,
    pub container: ContainerFormat,
    pub video_codec: VideoCodec,
    pub include_audio: bool,
    /// Artifact file name without extension
    pub output_basename: String,
    /// Media time covered by each encoded chunk
    pub chunk_timeslice_ms: u64,
    pub pacing: Pacing,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            progress_cadence_ms: DEFAULT_CADENCE.as_millis() as u64,
            metadata_timeout_ms: 10_000,
            container: ContainerFormat::WebM,
            video_codec: VideoCodec::Vp9,
            include_audio: false,
            output_basename: "compressed".to_string(),
            chunk_timeslice_ms: 1_000,
            pacing: Pacing::Realtime,
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Apply `VIDSHRINK_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<usize> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs; unrelated names are ignored.
    ///
    /// Returns how many values were applied.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut applied = 0;
        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            let known = match key {
                "PROGRESS_CADENCE_MS" => {
                    self.progress_cadence_ms = parse_millis(key, value)?;
                    true
                }
                "METADATA_TIMEOUT_MS" => {
                    self.metadata_timeout_ms = parse_millis(key, value)?;
                    true
                }
                "CHUNK_TIMESLICE_MS" => {
                    self.chunk_timeslice_ms = parse_millis(key, value)?;
                    true
                }
                "CONTAINER" => {
                    self.container = value.parse()?;
                    true
                }
                "VIDEO_CODEC" => {
                    self.video_codec = value.parse()?;
                    true
                }
                "INCLUDE_AUDIO" => {
                    self.include_audio = parse_flag(key, value)?;
                    true
                }
                "OUTPUT_BASENAME" => {
                    self.output_basename = value.to_string();
                    true
                }
                "PACING" => {
                    self.pacing = value.parse()?;
                    true
                }
                "LOG_LEVEL" => {
                    self.logging.level = value.parse::<LogLevel>()?;
                    true
                }
                _ => false,
            };
            if known {
                info!("Found environment override: {}{} = {}", ENV_PREFIX, key, value);
                applied += 1;
            }
        }
        Ok(applied)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_cadence_ms == 0 {
            bail!("progress_cadence_ms must be greater than zero");
        }
        if self.metadata_timeout_ms == 0 {
            bail!("metadata_timeout_ms must be greater than zero");
        }
        if self.chunk_timeslice_ms == 0 {
            bail!("chunk_timeslice_ms must be greater than zero");
        }
        let basename = self.output_basename.trim();
        if basename.is_empty() {
            bail!("output_basename cannot be empty");
        }
        if basename.contains(['/', '\\']) {
            bail!("output_basename must be a bare file name: {}", basename);
        }
        Ok(())
    }

    pub fn progress_cadence(&self) -> Duration {
        Duration::from_millis(self.progress_cadence_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn chunk_timeslice(&self) -> Duration {
        Duration::from_millis(self.chunk_timeslice_ms)
    }

    /// Encoder settings for one run at `bitrate`
    pub fn encoder_settings(&self, bitrate: BitrateTarget) -> EncoderSettings {
        EncoderSettings {
            bitrate,
            container: self.container,
            video_codec: self.video_codec,
            include_audio: self.include_audio,
            timeslice: self.chunk_timeslice(),
            output_basename: self.output_basename.trim().to_string(),
        }
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .with_context(|| format!("{}{} must be a whole number of milliseconds", ENV_PREFIX, key))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{}{} must be a boolean, got {}", ENV_PREFIX, key, other),
    }
}

/// Build the effective configuration: defaults, then `path` if given, then
/// the environment. The result is validated.
pub fn load_configuration(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            PipelineConfig::from_file(path)?
        }
        None => PipelineConfig::default(),
    };

    let overrides = config.apply_env_overrides()?;
    if overrides > 0 {
        info!("Applied {} environment variable overrides", overrides);
    }

    config.validate().context("Configuration rejected")?;
    Ok(config)
}
