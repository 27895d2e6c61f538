//! Code side of a full collection cycle.
//!
//! A pass walks the non-entrant blobs, turns the ones no live frame is
//! executing into zombies, reclaims every zombie from its region, and can
//! optionally drain nearly empty method regions into denser ones.

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::blob::Liveness;
use crate::config::CodeCacheConfig;
use crate::error::{CodeCacheError, Result};
use crate::manager::CodeCacheManager;
use crate::types::{BlobKind, EntryAddress};

/// Entry addresses found on any thread's call stack at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveFrames {
    entries: FxHashSet<EntryAddress>,
}

impl LiveFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: EntryAddress) {
        self.entries.insert(entry);
    }

    pub fn contains(&self, entry: EntryAddress) -> bool {
        self.entries.contains(&entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<EntryAddress> for LiveFrames {
    fn from_iter<I: IntoIterator<Item = EntryAddress>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Implemented by the execution engine to report which compiled code is
/// currently on a call stack.
pub trait FrameWalker: Send + Sync {
    fn live_entries(&self) -> LiveFrames;
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub zombies_marked: usize,
    pub blobs_reclaimed: usize,
    pub bytes_reclaimed: usize,
    pub blobs_relocated: usize,
    pub relocation_failures: usize,
}

/// Runs the code-cache side effects of a full collection.
///
/// Holds only policy; all state lives in the manager, so a trigger can be
/// reused across passes and managers.
#[derive(Debug, Clone, Copy)]
pub struct CollectionTrigger {
    consolidate: bool,
    occupancy_percent: u8,
    allow_non_method: bool,
}

impl CollectionTrigger {
    pub fn from_config(config: &CodeCacheConfig) -> Self {
        Self {
            consolidate: config.consolidate_on_collect,
            occupancy_percent: config.consolidation_occupancy_percent,
            allow_non_method: config.allow_non_method_fallback,
        }
    }

    /// Enable or disable region consolidation for this trigger.
    pub fn with_consolidation(mut self, enabled: bool) -> Self {
        self.consolidate = enabled;
        self
    }

    /// Collect using a fresh snapshot from `walker`.
    pub fn run_with(
        &self,
        manager: &CodeCacheManager,
        walker: &dyn FrameWalker,
    ) -> Result<CollectionStats> {
        self.run(manager, &walker.live_entries())
    }

    /// Run one pass against `frames`.
    pub fn run(&self, manager: &CodeCacheManager, frames: &LiveFrames) -> Result<CollectionStats> {
        let mut stats = CollectionStats::default();

        for blob in manager.blobs_in_state(Liveness::NonEntrant) {
            if manager.mark_zombie_if_unreferenced(&blob, frames) {
                stats.zombies_marked = stats.zombies_marked.saturating_add(1);
            }
        }

        for blob in manager.blobs_in_state(Liveness::Zombie) {
            if let Some(size) = manager.reclaim_zombie(&blob)? {
                stats.blobs_reclaimed = stats.blobs_reclaimed.saturating_add(1);
                stats.bytes_reclaimed = stats.bytes_reclaimed.saturating_add(size);
            }
        }

        if self.consolidate {
            self.consolidate(manager, &mut stats)?;
        }

        manager.note_collection();
        tracing::info!(
            zombies_marked = stats.zombies_marked,
            blobs_reclaimed = stats.blobs_reclaimed,
            bytes_reclaimed = stats.bytes_reclaimed,
            blobs_relocated = stats.blobs_relocated,
            relocation_failures = stats.relocation_failures,
            live_frames = frames.len(),
            "Code cache collection finished"
        );
        Ok(stats)
    }

    /// Regions that may receive blobs drained from `source`, best first.
    ///
    /// Only regions already denser than `source` qualify, so a blob never
    /// moves into a region that is as sparse as the one it leaves.
    fn targets(&self, manager: &CodeCacheManager, source: BlobKind) -> Vec<BlobKind> {
        let mut candidates: Vec<BlobKind> = source.sibling_method_region().into_iter().collect();
        if self.allow_non_method {
            candidates.push(BlobKind::NonMethod);
        }
        let from = manager.region(source);
        candidates.retain(|kind| *kind != source && manager.region(*kind).is_denser_than(from));
        candidates
    }

    fn consolidate(&self, manager: &CodeCacheManager, stats: &mut CollectionStats) -> Result<()> {
        let threshold = usize::from(self.occupancy_percent);
        for source in BlobKind::ALL.into_iter().filter(|kind| kind.is_method_region()) {
            let region = manager.region(source);
            if region.blob_count() == 0 || region.occupancy_percent() > threshold {
                continue;
            }

            for id in region.resident_blobs() {
                let Ok(blob) = manager.blob(id) else {
                    continue;
                };
                // Non-entrant blobs are left for reclamation.
                if !blob.is_entrant() {
                    continue;
                }
                // Re-evaluated per blob: each move makes the source sparser.
                let targets = self.targets(manager, source);
                if targets.is_empty() {
                    continue;
                }

                let mut moved = false;
                for target in targets {
                    match manager.move_to_region(id, target) {
                        Ok(()) => {
                            moved = true;
                            break;
                        }
                        Err(e) if e.is_capacity() => continue,
                        // Reclaimed by a concurrent pass.
                        Err(CodeCacheError::InvalidBlobReference(_)) => break,
                        Err(e) => return Err(e),
                    }
                }
                if moved {
                    stats.blobs_relocated = stats.blobs_relocated.saturating_add(1);
                } else {
                    stats.relocation_failures = stats.relocation_failures.saturating_add(1);
                    tracing::debug!(blob = %id, region = %source, "No denser region can take blob during consolidation");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::CompiledArtifact;
    use crate::manager::ReplaceOptions;
    use crate::types::{CompilationLevel, MethodId};

    fn install(manager: &CodeCacheManager, method: u64, level: CompilationLevel, size: usize) {
        manager
            .install_blob(MethodId(method), CompiledArtifact::new(level, vec![0u8; size]), false)
            .expect("install");
    }

    struct FixedFrames(Vec<EntryAddress>);

    impl FrameWalker for FixedFrames {
        fn live_entries(&self) -> LiveFrames {
            self.0.iter().copied().collect()
        }
    }

    #[test]
    fn test_empty_pass_is_noop() {
        let manager = CodeCacheManager::default();
        install(&manager, 1, CompilationLevel::Tier4, 64);
        let stats = manager.collect(&LiveFrames::new()).expect("collect");
        assert_eq!(stats, CollectionStats::default());
        assert_eq!(manager.metrics().snapshot().collections, 1);
    }

    #[test]
    fn test_replaced_blob_on_stack_survives() {
        let manager = CodeCacheManager::default();
        install(&manager, 1, CompilationLevel::Tier4, 64);
        let old = manager.describe_blob(MethodId(1), false).expect("installed");
        manager
            .replace_entrant_blob(MethodId(1), false, ReplaceOptions::default())
            .expect("replace");

        let walker = FixedFrames(vec![old.entry_address]);
        let stats = CollectionTrigger::from_config(manager.config())
            .run_with(&manager, &walker)
            .expect("collect");

        assert_eq!(stats.zombies_marked, 0);
        assert_eq!(
            manager.blob_info(old.blob_id).expect("still resident").liveness,
            Liveness::NonEntrant
        );

        // Once the frame returns the next pass reclaims it.
        let stats = manager.collect(&LiveFrames::new()).expect("collect");
        assert_eq!(stats.zombies_marked, 1);
        assert_eq!(stats.blobs_reclaimed, 1);
        assert_eq!(stats.bytes_reclaimed, 64);
        assert!(manager.blob_info(old.blob_id).is_err());
    }

    #[test]
    fn test_consolidation_drains_sparse_region_into_denser_one() {
        let manager = CodeCacheManager::default();
        install(&manager, 1, CompilationLevel::Tier4, 4096);
        install(&manager, 2, CompilationLevel::Tier3, 128);
        let id = manager.describe_blob(MethodId(2), false).expect("installed").blob_id;

        let trigger = CollectionTrigger::from_config(manager.config()).with_consolidation(true);
        let stats = trigger.run(&manager, &LiveFrames::new()).expect("collect");

        assert_eq!(stats.blobs_relocated, 1);
        assert_eq!(manager.blob_info(id).expect("resident").region, BlobKind::NonProfiled);
        assert_eq!(manager.region(BlobKind::Profiled).blob_count(), 0);
        manager.check_invariants().expect("accounting holds");

        let stats = trigger.run(&manager, &LiveFrames::new()).expect("collect");
        assert_eq!(stats.blobs_relocated, 0);
        assert_eq!(stats.relocation_failures, 0);
    }

    #[test]
    fn test_consolidation_leaves_lone_blob_in_place() {
        let manager = CodeCacheManager::default();
        install(&manager, 1, CompilationLevel::Tier4, 64);
        let id = manager.describe_blob(MethodId(1), false).expect("installed").blob_id;

        let trigger = CollectionTrigger::from_config(manager.config()).with_consolidation(true);
        for _ in 0..4 {
            let stats = trigger.run(&manager, &LiveFrames::new()).expect("collect");
            assert_eq!(stats.blobs_relocated, 0);
            assert_eq!(stats.relocation_failures, 0);
            assert_eq!(manager.blob_info(id).expect("resident").region, BlobKind::NonProfiled);
        }
        assert_eq!(manager.metrics().snapshot().relocations, 0);
    }

    #[test]
    fn test_consolidation_counts_failures() {
        let config = CodeCacheConfig {
            profiled_capacity: 4096,
            non_profiled_capacity: 4096,
            non_method_capacity: 32,
            consolidate_on_collect: true,
            consolidation_occupancy_percent: 50,
            ..Default::default()
        };
        let manager = CodeCacheManager::new(config).expect("valid config");
        // Fill the non-profiled region past the threshold so it is not drained
        // and cannot take the profiled blob.
        install(&manager, 1, CompilationLevel::Tier4, 4000);
        install(&manager, 2, CompilationLevel::Tier3, 256);

        let stats = manager.collect(&LiveFrames::new()).expect("collect");
        assert_eq!(stats.blobs_relocated, 0);
        assert_eq!(stats.relocation_failures, 1);
        assert_eq!(
            manager.describe_blob(MethodId(2), false).expect("installed").region,
            BlobKind::Profiled
        );
    }
}
