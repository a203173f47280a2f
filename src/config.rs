//! Application configuration
//!
//! Loaded from a JSON file (default `config.json`, overridable as the first
//! command-line argument). A missing file is not an error: defaults apply
//! and a note is logged, so the bridge comes up on a bare system.

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_pipe_path() -> String {
    "/tmp/shiri_audio_pipe".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_buffer_duration_ms() -> u32 {
    2000
}

fn default_speaker_port() -> u16 {
    5000
}

/// A statically configured speaker. Discovery normally supersedes these;
/// they seed the registry so operators see known speakers before the first
/// mDNS snapshot arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSpeaker {
    pub ip: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_speaker_port")]
    pub port: u16,
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Legacy PCM pipe path kept for external tooling that still writes
    /// into the bridge directly.
    #[serde(default = "default_pipe_path")]
    pub pipe_path: String,

    /// Port for the HTTP control plane.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Sync buffer duration for the legacy pipe input.
    #[serde(default = "default_buffer_duration_ms")]
    pub buffer_duration_ms: u32,

    /// Statically configured speakers.
    #[serde(default)]
    pub speakers: Vec<StaticSpeaker>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipe_path: default_pipe_path(),
            api_port: default_api_port(),
            buffer_duration_ms: default_buffer_duration_ms(),
            speakers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file is missing or unparsable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                return Self::default();
            }
        };

        match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Error parsing {}: {}. Using defaults", path.display(), e);
                Self::default()
            }
        }
    }
}
