//! Configuration for the tile engine.

use serde::{Deserialize, Serialize};

/// Configuration for the tile scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Memory budget for the tile cache in megabytes (0 = unbounded).
    pub tile_cache_size_mb: usize,

    /// Tile width used when computing whole bands.
    pub tile_width: usize,

    /// Tile height used when computing whole bands.
    pub tile_height: usize,

    /// Maximum number of tiles computed concurrently by `compute_band`.
    pub max_concurrent_tiles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_cache_size_mb: 512,
            tile_width: 512,
            tile_height: 512,
            max_concurrent_tiles: 8,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TILE_CACHE_SIZE_MB") {
            if let Ok(size) = val.parse() {
                config.tile_cache_size_mb = size;
            }
        }

        if let Ok(val) = std::env::var("TILE_WIDTH") {
            if let Ok(size) = val.parse() {
                config.tile_width = size;
            }
        }

        if let Ok(val) = std::env::var("TILE_HEIGHT") {
            if let Ok(size) = val.parse() {
                config.tile_height = size;
            }
        }

        if let Ok(val) = std::env::var("MAX_CONCURRENT_TILES") {
            if let Ok(count) = val.parse() {
                config.max_concurrent_tiles = count;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err("tile_width and tile_height must be > 0".to_string());
        }

        if self.max_concurrent_tiles == 0 {
            return Err("max_concurrent_tiles must be > 0".to_string());
        }

        Ok(())
    }

    /// Get the tile cache budget in bytes (0 = unbounded).
    pub fn tile_cache_size_bytes(&self) -> usize {
        self.tile_cache_size_mb * 1024 * 1024
    }
}
