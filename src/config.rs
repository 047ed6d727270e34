//! Configuration for AtlasArray
//!
//! Centralized configuration with sensible defaults. A `Config` is handed to
//! `Engine::new` and shared by every session opened through that engine.

use crate::error::{AtlasError, Result};

/// Main configuration for an AtlasArray engine
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Consolidation Configuration
    // -------------------------------------------------------------------------
    /// Size (in bytes) of each attribute buffer used to stream cells from the
    /// old fragments into the consolidated one
    pub consolidation_buffer_size: usize,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// fsync tile files and the fragment book before a fragment is published
    pub sync_on_finalize: bool,

    // -------------------------------------------------------------------------
    // Iterator Configuration
    // -------------------------------------------------------------------------
    /// How iterators fill their look-ahead buffer set
    pub prefetch_mode: PrefetchMode,
}

/// Iterator prefetch strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    /// Fill the look-ahead buffers inline, right after a swap
    Synchronous,

    /// Fill the look-ahead buffers on a background worker thread
    Background,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consolidation_buffer_size: 4 * 1024 * 1024, // 4 MB
            sync_on_finalize: true,
            prefetch_mode: PrefetchMode::Background,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.consolidation_buffer_size == 0 {
            return Err(AtlasError::Config(
                "consolidation_buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the per-attribute buffer size used by consolidation (in bytes)
    pub fn consolidation_buffer_size(mut self, size: usize) -> Self {
        self.config.consolidation_buffer_size = size;
        self
    }

    /// Enable or disable fsync before publishing fragments
    pub fn sync_on_finalize(mut self, sync: bool) -> Self {
        self.config.sync_on_finalize = sync;
        self
    }

    /// Set the iterator prefetch strategy
    pub fn prefetch_mode(mut self, mode: PrefetchMode) -> Self {
        self.config.prefetch_mode = mode;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
