//! Engine configuration.
//!
//! Hosts can embed an `[engine]`-style table in their own TOML config and load it with
//! [`EngineConfig::load`]; every field has a default so partial tables are fine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::mixer::Interpolation;

/// Default duration of one ring buffer.
pub const DEFAULT_CHUNK_MS: u32 = 28;

/// Tuning shared by the pool, the buffer ring and the playback tasks.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory every sound path is resolved against.
    pub storage_root: PathBuf,
    /// Length of one ring buffer in milliseconds.
    pub chunk_ms: u32,
    /// Priority of the threads that call `play` (lower value = more urgent).
    pub caller_priority: i32,
    /// Most urgent priority a playback task may run at.
    pub priority_min: i32,
    /// Least urgent priority a playback task may run at.
    pub priority_max: i32,
    /// Stack size of each playback task in bytes.
    pub task_stack_size: usize,
    /// Interpolation requested from the hardware for every channel.
    pub interpolation: Interpolation,
    /// Per-channel mix weights handed to the hardware (front L/R first).
    pub mix: [f32; 12],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("assets"),
            chunk_ms: DEFAULT_CHUNK_MS,
            caller_priority: 0x30,
            priority_min: 0x18,
            priority_max: 0x3F,
            task_stack_size: 32 * 1024,
            interpolation: Interpolation::Polyphase,
            mix: [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        }
    }
}

impl EngineConfig {
    /// Config rooted at `storage_root`, everything else default.
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<EngineConfig>(raw)?;
        if cfg.priority_min > cfg.priority_max {
            anyhow::bail!(
                "priority_min ({}) must not exceed priority_max ({})",
                cfg.priority_min,
                cfg.priority_max
            );
        }
        Ok(cfg)
    }

    /// Resolve a sound path against the storage root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.storage_root.join(path)
    }

    /// Chunk length, falling back to the default for a zero setting.
    pub fn effective_chunk_ms(&self) -> u32 {
        if self.chunk_ms == 0 {
            DEFAULT_CHUNK_MS
        } else {
            self.chunk_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str("storage_root = \"/srv/romfs\"\nchunk_ms = 40\n")
            .unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/srv/romfs"));
        assert_eq!(cfg.chunk_ms, 40);
        assert_eq!(cfg.priority_min, 0x18);
        assert_eq!(cfg.interpolation, Interpolation::Polyphase);
    }

    #[test]
    fn inverted_priority_range_is_rejected() {
        let err = EngineConfig::from_toml_str("priority_min = 10\npriority_max = 5\n").unwrap_err();
        assert!(err.to_string().contains("priority_min"));
    }

    #[test]
    fn interpolation_parses_snake_case() {
        let cfg = EngineConfig::from_toml_str("interpolation = \"linear\"\n").unwrap();
        assert_eq!(cfg.interpolation, Interpolation::Linear);
    }

    #[test]
    fn load_reports_path_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("engine.toml"));
    }

    #[test]
    fn resolve_joins_storage_root() {
        let cfg = EngineConfig::with_storage_root("/romfs");
        assert_eq!(
            cfg.resolve(Path::new("bgm/title.ogg")),
            PathBuf::from("/romfs/bgm/title.ogg")
        );
    }

    #[test]
    fn zero_chunk_falls_back_to_default() {
        let cfg = EngineConfig {
            chunk_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.effective_chunk_ms(), DEFAULT_CHUNK_MS);
    }
}
