//! Configuration system for Shuttle.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHUTTLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shuttle/config.toml
//!   3. ~/.config/shuttle/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{chunk_frame_len, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_DATAGRAM};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub protocol: ProtocolConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bytes per chunk. Must fit a RESPONSE frame inside `max_datagram`.
    pub chunk_size: usize,
    /// Largest datagram either side sends or expects to receive.
    pub max_datagram: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP listen address.
    pub bind: String,
    /// Directory requests are resolved under. Empty = serve paths as given.
    pub serve_root: PathBuf,
    /// Session is dropped after this long without inbound traffic.
    pub idle_timeout_ms: u64,
    /// Inbound datagrams buffered per session.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Silence after which the client asks for a retransmission.
    pub retransmit_timeout_ms: u64,
    /// Consecutive silent timeouts before the transfer is abandoned.
    pub max_stalls: u32,
    /// Where received files are written.
    pub output_dir: PathBuf,
    /// Appended to the requested file's base name.
    pub output_suffix: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_datagram: DEFAULT_MAX_DATAGRAM,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2224".to_string(),
            serve_root: PathBuf::new(),
            idle_timeout_ms: 10_000,
            queue_depth: 64,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: 2_000,
            max_stalls: 5,
            output_dir: PathBuf::from("."),
            output_suffix: ".copy".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// `None` when no serve root is configured.
    pub fn serve_root(&self) -> Option<&std::path::Path> {
        if self.serve_root.as_os_str().is_empty() {
            None
        } else {
            Some(&self.serve_root)
        }
    }
}

impl ClientConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shuttle")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShuttleConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ShuttleConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHUTTLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShuttleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.protocol;
        if p.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be non-zero".into()));
        }
        if chunk_frame_len(p.chunk_size) > p.max_datagram {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} needs {}-byte frames, max_datagram is {}",
                p.chunk_size,
                chunk_frame_len(p.chunk_size),
                p.max_datagram
            )));
        }
        if self.server.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be non-zero".into()));
        }
        if self.server.idle_timeout_ms == 0 || self.client.retransmit_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Apply SHUTTLE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHUTTLE_SERVER__BIND") {
            self.server.bind = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_SERVER__SERVE_ROOT") {
            self.server.serve_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHUTTLE_SERVER__IDLE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.server.idle_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_PROTOCOL__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.protocol.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_PROTOCOL__MAX_DATAGRAM") {
            if let Ok(n) = v.parse() {
                self.protocol.max_datagram = n;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_CLIENT__RETRANSMIT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.client.retransmit_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_CLIENT__OUTPUT_DIR") {
            self.client.output_dir = PathBuf::from(v);
        }
    }
}
