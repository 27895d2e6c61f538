//! TOML-compatible configuration for the code cache.
//!
//! ```toml
//! profiled_capacity = 1048576
//! non_profiled_capacity = 1048576
//! non_method_capacity = 262144
//! compile_threshold = 1000
//! consolidate_on_collect = true
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CodeCacheError, Result};
use crate::types::BlobKind;

/// Configuration for a [`CodeCacheManager`](crate::manager::CodeCacheManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeCacheConfig {
    /// Capacity of the profiled-tier region in bytes (default 2 MiB).
    pub profiled_capacity: usize,
    /// Capacity of the non-profiled-tier region in bytes (default 2 MiB).
    pub non_profiled_capacity: usize,
    /// Capacity of the non-method region in bytes (default 512 KiB).
    pub non_method_capacity: usize,
    /// Invocations before a method is queued for compilation (default 1000).
    pub compile_threshold: u64,
    /// Free-list entries inspected before falling back to bump allocation.
    pub max_fit_probes: usize,
    /// Let method blobs spill into the non-method region when both method
    /// regions are full.
    pub allow_non_method_fallback: bool,
    /// Move entrant blobs out of nearly empty method regions during collection.
    pub consolidate_on_collect: bool,
    /// Occupancy (percent of capacity) at or below which a method region is
    /// considered nearly empty.
    pub consolidation_occupancy_percent: u8,
}

impl CodeCacheConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| CodeCacheError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Capacity configured for the given region.
    pub fn capacity_of(&self, kind: BlobKind) -> usize {
        match kind {
            BlobKind::Profiled => self.profiled_capacity,
            BlobKind::NonProfiled => self.non_profiled_capacity,
            BlobKind::NonMethod => self.non_method_capacity,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.profiled_capacity == 0 || self.non_profiled_capacity == 0 {
            return Err(CodeCacheError::InvalidConfig(
                "method region capacities must be > 0".to_string(),
            ));
        }
        if self.compile_threshold == 0 {
            return Err(CodeCacheError::InvalidConfig(
                "compile_threshold must be > 0".to_string(),
            ));
        }
        if self.max_fit_probes == 0 {
            return Err(CodeCacheError::InvalidConfig(
                "max_fit_probes must be > 0".to_string(),
            ));
        }
        if self.consolidation_occupancy_percent > 100 {
            return Err(CodeCacheError::InvalidConfig(format!(
                "consolidation_occupancy_percent must be in [0, 100], got {}",
                self.consolidation_occupancy_percent
            )));
        }
        Ok(())
    }
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            profiled_capacity: 2 * 1024 * 1024,
            non_profiled_capacity: 2 * 1024 * 1024,
            non_method_capacity: 512 * 1024,
            compile_threshold: 1000,
            max_fit_probes: 16,
            allow_non_method_fallback: true,
            consolidate_on_collect: false,
            consolidation_occupancy_percent: 10,
        }
    }
}
