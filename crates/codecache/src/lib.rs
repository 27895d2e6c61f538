//! Tiered compiled-code lifecycle and code cache manager.
//!
//! Tracks, per method, which compiled blob new calls should enter, places
//! blobs into segmented code regions, and retires replaced code safely: a
//! blob that stops being entrant stays resident until a collection pass
//! confirms that no live frame is still executing it.
//!
//! # Architecture
//!
//! ```text
//! compiler pipeline ──CompilerEvent──► compiler_thread (code-installer)
//!                                            │
//!                                            ▼
//!                                      CodeCacheManager
//!   ├── record    — per-method queued flag, standard and OSR slots, history
//!   ├── blob      — compiled code with Entrant → NonEntrant → Zombie liveness
//!   ├── region    — Profiled / NonProfiled / NonMethod arenas
//!   ├── counter   — invocation counts driving the compile threshold
//!   └── collector — zombie marking, reclamation and region consolidation
//! ```
//!
//! Every manager is an independent value. There is no global state, so any
//! number of caches can coexist in one process.

pub mod blob;
pub mod collector;
pub mod compiler_thread;
pub mod config;
pub mod counter;
pub mod error;
pub mod manager;
pub mod record;
pub mod region;
pub mod types;

pub use blob::{BlobDescription, CompiledArtifact, CompiledBlob, Liveness};
pub use collector::{CollectionStats, CollectionTrigger, FrameWalker, LiveFrames};
pub use compiler_thread::{CompileResult, CompilerEvent, CompilerThread};
pub use config::CodeCacheConfig;
pub use error::{CodeCacheError, Result};
pub use manager::{CodeCacheManager, ReplaceOptions};
pub use region::{CodeRegion, Placement, RegionReport};
pub use types::{
    BlobId, BlobKind, CodeCacheMetrics, CompilationLevel, EntryAddress, MethodId, MethodState,
    MetricsSnapshot,
};
