//! Error types for the code cache.

use crate::types::{BlobId, BlobKind, CompilationLevel, MethodId};

/// Errors returned by code cache operations.
///
/// A failed operation leaves the cache exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeCacheError {
    /// Replace, deoptimize or describe requested on an empty method slot.
    #[error("{method} has no entrant {} blob", slot_name(.is_osr))]
    NoCompiledArtifact {
        /// Method that was addressed.
        method: MethodId,
        /// Whether the OSR slot was addressed.
        is_osr: bool,
    },

    /// A region cannot fit the requested allocation.
    #[error("{region} region cannot fit {requested} bytes ({available} bytes free)")]
    RegionCapacity {
        /// Region that rejected the allocation.
        region: BlobKind,
        /// Requested size in bytes.
        requested: usize,
        /// Free bytes in the region at the time of the request.
        available: usize,
    },

    /// Query or relocation against a removed or unknown blob.
    #[error("invalid blob reference: {0}")]
    InvalidBlobReference(BlobId),

    /// Install would lower the level of an occupied slot.
    #[error(
        "cannot install level {requested} over level {current} in {} slot of {method}",
        slot_name(.is_osr)
    )]
    LevelDowngrade {
        method: MethodId,
        is_osr: bool,
        current: CompilationLevel,
        requested: CompilationLevel,
    },

    /// Artifacts must be compiled at a real tier.
    #[error("invalid compilation level for an artifact: {0}")]
    InvalidLevel(CompilationLevel),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal accounting check failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl CodeCacheError {
    /// Whether the caller may retry the operation against a different region.
    pub fn is_capacity(&self) -> bool {
        matches!(self, CodeCacheError::RegionCapacity { .. })
    }
}

fn slot_name(is_osr: &bool) -> &'static str {
    if *is_osr { "osr" } else { "standard" }
}

pub type Result<T> = std::result::Result<T, CodeCacheError>;
