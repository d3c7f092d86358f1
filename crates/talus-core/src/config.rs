//! Engine configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TALUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/talus/config.toml
//!   3. ~/.config/talus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::pool::{Backing, FallbackPolicy, PoolConfig};

/// Top-level configuration. Plain values — all behavior they control is
/// described by the pool and session modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    /// Initial per-session read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Chunk size used by the logical output stream.
    pub write_chunk_size: usize,
    /// Maximum buffers drained into one scatter-gather write.
    pub write_batch_limit: usize,
    /// Write-queue depth at which reads on the session pause.
    pub high_watermark: usize,
    /// Depth at or under which paused reads resume. Must be below the high
    /// watermark — the gap is the hysteresis that prevents oscillation.
    pub low_watermark: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub page_size: usize,
    pub page_count: usize,
    /// Back pages with an anonymous mapping instead of heap memory.
    pub direct_memory: bool,
    /// On exhaustion, serve requests unpooled instead of failing them.
    pub unpooled_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            read_buffer_size: 8 * 1024,
            write_chunk_size: 4 * 1024,
            write_batch_limit: 1000,
            high_watermark: 10_000,
            low_watermark: 8_000,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            page_count: 64,
            direct_memory: false,
            unpooled_fallback: true,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            page_size: self.page_size,
            page_count: self.page_count,
            backing: if self.direct_memory { Backing::Mapped } else { Backing::Heap },
            fallback: if self.unpooled_fallback {
                FallbackPolicy::Unpooled
            } else {
                FallbackPolicy::Fail
            },
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load config: env vars → file → defaults. Validates before returning.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EngineConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TALUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.page_size == 0 || self.pool.page_count == 0 {
            return Err(ConfigError::Invalid("pool page size and count must be non-zero".into()));
        }
        if self.read_buffer_size == 0 || self.write_chunk_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        if self.write_batch_limit == 0 {
            return Err(ConfigError::Invalid("write batch limit must be non-zero".into()));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "low watermark {} must be below high watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }

    /// Apply TALUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TALUS_POOL__PAGE_SIZE") {
            if let Ok(n) = v.parse() {
                self.pool.page_size = n;
            }
        }
        if let Ok(v) = std::env::var("TALUS_POOL__PAGE_COUNT") {
            if let Ok(n) = v.parse() {
                self.pool.page_count = n;
            }
        }
        if let Ok(v) = std::env::var("TALUS_POOL__DIRECT_MEMORY") {
            self.pool.direct_memory = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TALUS_HIGH_WATERMARK") {
            if let Ok(n) = v.parse() {
                self.high_watermark = n;
            }
        }
        if let Ok(v) = std::env::var("TALUS_LOW_WATERMARK") {
            if let Ok(n) = v.parse() {
                self.low_watermark = n;
            }
        }
    }
}


// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("talus")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}
