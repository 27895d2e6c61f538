//! Core types for the code cache.
//!
//! Compilation tiers, region tags, opaque handles and the atomic event
//! counters shared by every other module.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::CodeCacheError;

/// Tier a blob was compiled at.
///
/// The derived ordering is the upgrade order: installing a blob whose level is
/// lower than the one currently installed is a downgrade.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum CompilationLevel {
    /// Interpreted only, nothing compiled.
    #[default]
    None,
    /// Simple compilation without profiling.
    Tier1,
    /// Compilation with invocation and backedge counters.
    Tier2,
    /// Compilation with full profiling.
    Tier3,
    /// Fully optimized.
    Tier4,
}

impl CompilationLevel {
    pub const COMPILED: [CompilationLevel; 4] = [
        CompilationLevel::Tier1,
        CompilationLevel::Tier2,
        CompilationLevel::Tier3,
        CompilationLevel::Tier4,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            CompilationLevel::None => 0,
            CompilationLevel::Tier1 => 1,
            CompilationLevel::Tier2 => 2,
            CompilationLevel::Tier3 => 3,
            CompilationLevel::Tier4 => 4,
        }
    }

    pub fn is_compiled(self) -> bool {
        self != CompilationLevel::None
    }

    /// Whether code at this level collects profile data.
    pub fn is_profiled(self) -> bool {
        matches!(self, CompilationLevel::Tier2 | CompilationLevel::Tier3)
    }

    /// Region a freshly compiled blob at this level is placed in first.
    pub fn preferred_region(self) -> BlobKind {
        if self.is_profiled() {
            BlobKind::Profiled
        } else {
            BlobKind::NonProfiled
        }
    }
}

impl TryFrom<u8> for CompilationLevel {
    type Error = CodeCacheError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompilationLevel::None),
            1 => Ok(CompilationLevel::Tier1),
            2 => Ok(CompilationLevel::Tier2),
            3 => Ok(CompilationLevel::Tier3),
            4 => Ok(CompilationLevel::Tier4),
            other => Err(CodeCacheError::InvalidConfig(format!(
                "unknown compilation level {other}"
            ))),
        }
    }
}

impl fmt::Display for CompilationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Tag of a code region. Each region only holds blobs of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlobKind {
    /// Profiled tiers (Tier2, Tier3).
    Profiled,
    /// Non-profiled tiers (Tier1, Tier4).
    NonProfiled,
    /// Runtime stubs and cold code demoted out of the method regions.
    NonMethod,
}

impl BlobKind {
    pub const ALL: [BlobKind; 3] = [
        BlobKind::Profiled,
        BlobKind::NonProfiled,
        BlobKind::NonMethod,
    ];

    pub fn index(self) -> usize {
        match self {
            BlobKind::Profiled => 0,
            BlobKind::NonProfiled => 1,
            BlobKind::NonMethod => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn is_method_region(self) -> bool {
        self != BlobKind::NonMethod
    }

    /// The other region that holds method code, if any.
    pub fn sibling_method_region(self) -> Option<BlobKind> {
        match self {
            BlobKind::Profiled => Some(BlobKind::NonProfiled),
            BlobKind::NonProfiled => Some(BlobKind::Profiled),
            BlobKind::NonMethod => None,
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlobKind::Profiled => "profiled",
            BlobKind::NonProfiled => "non-profiled",
            BlobKind::NonMethod => "non-method",
        };
        f.write_str(name)
    }
}

/// Caller-supplied stable handle of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// Unique id of a compiled blob within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob#{}", self.0)
    }
}

/// Opaque address execution jumps to. Never reused within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryAddress(pub u64);

impl fmt::Display for EntryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Read-only view of a method slot, as reported to introspection clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MethodState {
    pub queued: bool,
    pub compiled: bool,
    pub level: CompilationLevel,
}

/// Atomic metrics for code cache events.
#[derive(Debug)]
pub struct CodeCacheMetrics {
    /// Blobs installed through `install_blob`.
    pub installs: AtomicU64,
    /// Blobs created by `replace_entrant_blob`.
    pub replacements: AtomicU64,
    /// Slots emptied by `deoptimize`.
    pub deoptimizations: AtomicU64,
    /// Entrant to non-entrant transitions.
    pub made_not_entrant: AtomicU64,
    /// Non-entrant to zombie transitions.
    pub zombies_marked: AtomicU64,
    /// Blobs removed from their region.
    pub blobs_reclaimed: AtomicU64,
    /// Bytes returned to regions by reclamation.
    pub bytes_reclaimed: AtomicU64,
    /// Blobs moved between regions.
    pub relocations: AtomicU64,
    /// Reservations that fell back to a non-preferred region.
    pub region_fallbacks: AtomicU64,
    /// Reservations that could not be satisfied by any candidate region.
    pub allocation_failures: AtomicU64,
    /// Compile-failure notifications.
    pub compile_failures: AtomicU64,
    /// Completed collection passes.
    pub collections: AtomicU64,
}

/// Point-in-time copy of [`CodeCacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub installs: u64,
    pub replacements: u64,
    pub deoptimizations: u64,
    pub made_not_entrant: u64,
    pub zombies_marked: u64,
    pub blobs_reclaimed: u64,
    pub bytes_reclaimed: u64,
    pub relocations: u64,
    pub region_fallbacks: u64,
    pub allocation_failures: u64,
    pub compile_failures: u64,
    pub collections: u64,
}

impl CodeCacheMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            installs: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
            deoptimizations: AtomicU64::new(0),
            made_not_entrant: AtomicU64::new(0),
            zombies_marked: AtomicU64::new(0),
            blobs_reclaimed: AtomicU64::new(0),
            bytes_reclaimed: AtomicU64::new(0),
            relocations: AtomicU64::new(0),
            region_fallbacks: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            collections: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Reset all counters to zero.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&self) {
        for counter in [
            &self.installs,
            &self.replacements,
            &self.deoptimizations,
            &self.made_not_entrant,
            &self.zombies_marked,
            &self.blobs_reclaimed,
            &self.bytes_reclaimed,
            &self.relocations,
            &self.region_fallbacks,
            &self.allocation_failures,
            &self.compile_failures,
            &self.collections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            installs: self.installs.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            deoptimizations: self.deoptimizations.load(Ordering::Relaxed),
            made_not_entrant: self.made_not_entrant.load(Ordering::Relaxed),
            zombies_marked: self.zombies_marked.load(Ordering::Relaxed),
            blobs_reclaimed: self.blobs_reclaimed.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            region_fallbacks: self.region_fallbacks.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
        }
    }
}

impl Default for CodeCacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
