//! Code cache manager.
//!
//! Owns every method record, every blob and the three code regions. It is
//! the only component that rewrites a record's installed blobs.
//!
//! # Locking
//!
//! Each method record sits behind its own `RwLock`. Install, replace,
//! deoptimize, move and the collector's per-blob steps take the record's
//! write lock, so they are serialized per method while different methods
//! proceed in parallel. Locks are always acquired in the order
//! record → blob table → region(s); regions are locked in [`BlobKind`] order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;

use crate::blob::{BlobDescription, CompiledArtifact, CompiledBlob, Liveness};
use crate::collector::{CollectionStats, CollectionTrigger, LiveFrames};
use crate::compiler_thread::CompilerEvent;
use crate::config::CodeCacheConfig;
use crate::counter::InvocationCounter;
use crate::error::{CodeCacheError, Result};
use crate::record::{LevelChange, MethodRecord};
use crate::region::{CodeRegion, RegionReport};
use crate::types::{
    BlobId, BlobKind, CodeCacheMetrics, CompilationLevel, EntryAddress, MethodId, MethodState,
};

/// Base of the opaque entry address space handed out to blobs.
pub const CODE_SPACE_BASE: u64 = 0x7f00_0000_0000;

/// Overrides for [`CodeCacheManager::replace_entrant_blob`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOptions {
    /// Level of the regenerated blob. Defaults to the replaced blob's level.
    pub level: Option<CompilationLevel>,
    /// Region the regenerated blob must land in. When unset, a method region
    /// of a different kind than the replaced blob's is preferred.
    pub region: Option<BlobKind>,
}

impl ReplaceOptions {
    pub fn at_level(level: CompilationLevel) -> Self {
        Self {
            level: Some(level),
            region: None,
        }
    }

    pub fn in_region(region: BlobKind) -> Self {
        Self {
            level: None,
            region: Some(region),
        }
    }
}

type SharedRecord = Arc<RwLock<MethodRecord>>;

fn read_record(record: &RwLock<MethodRecord>) -> RwLockReadGuard<'_, MethodRecord> {
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    let guard = record.read().unwrap();
    guard
}

fn write_record(record: &RwLock<MethodRecord>) -> RwLockWriteGuard<'_, MethodRecord> {
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    let guard = record.write().unwrap();
    guard
}

fn push_unique(order: &mut Vec<BlobKind>, kind: BlobKind) {
    if !order.contains(&kind) {
        order.push(kind);
    }
}

/// Tracks compiled code for every method and the regions it lives in.
///
/// No state is global: tests and embedders may run any number of independent
/// managers side by side.
#[derive(Debug)]
pub struct CodeCacheManager {
    config: CodeCacheConfig,
    profiled: CodeRegion,
    non_profiled: CodeRegion,
    non_method: CodeRegion,
    records: RwLock<FxHashMap<MethodId, SharedRecord>>,
    blobs: RwLock<FxHashMap<BlobId, Arc<CompiledBlob>>>,
    next_blob_id: AtomicU64,
    next_address: AtomicU64,
    counter: InvocationCounter,
    metrics: CodeCacheMetrics,
}

impl CodeCacheManager {
    /// Create a manager after validating `config`.
    pub fn new(config: CodeCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CodeCacheConfig) -> Self {
        let region =
            |kind: BlobKind| CodeRegion::new(kind, config.capacity_of(kind), config.max_fit_probes);
        Self {
            profiled: region(BlobKind::Profiled),
            non_profiled: region(BlobKind::NonProfiled),
            non_method: region(BlobKind::NonMethod),
            config,
            records: RwLock::new(FxHashMap::default()),
            blobs: RwLock::new(FxHashMap::default()),
            next_blob_id: AtomicU64::new(1),
            next_address: AtomicU64::new(CODE_SPACE_BASE),
            counter: InvocationCounter::new(),
            metrics: CodeCacheMetrics::new(),
        }
    }

    pub fn config(&self) -> &CodeCacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CodeCacheMetrics {
        &self.metrics
    }

    pub fn region(&self, kind: BlobKind) -> &CodeRegion {
        match kind {
            BlobKind::Profiled => &self.profiled,
            BlobKind::NonProfiled => &self.non_profiled,
            BlobKind::NonMethod => &self.non_method,
        }
    }

    pub fn regions(&self) -> [&CodeRegion; 3] {
        [&self.profiled, &self.non_profiled, &self.non_method]
    }

    // -- Records and blob table --

    fn record(&self, method: MethodId) -> Option<SharedRecord> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let records = self.records.read().unwrap();
        records.get(&method).cloned()
    }

    fn record_or_insert(&self, method: MethodId) -> SharedRecord {
        if let Some(record) = self.record(method) {
            return record;
        }
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut records = self.records.write().unwrap();
        Arc::clone(
            records
                .entry(method)
                .or_insert_with(|| Arc::new(RwLock::new(MethodRecord::new(method)))),
        )
    }

    /// Look up a resident blob.
    pub fn blob(&self, id: BlobId) -> Result<Arc<CompiledBlob>> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let blobs = self.blobs.read().unwrap();
        blobs
            .get(&id)
            .cloned()
            .ok_or(CodeCacheError::InvalidBlobReference(id))
    }

    fn is_resident(&self, id: BlobId) -> bool {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let blobs = self.blobs.read().unwrap();
        blobs.contains_key(&id)
    }

    /// Snapshot of resident blobs in the given state.
    pub(crate) fn blobs_in_state(&self, liveness: Liveness) -> Vec<Arc<CompiledBlob>> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let blobs = self.blobs.read().unwrap();
        let mut selected: Vec<_> = blobs
            .values()
            .filter(|blob| blob.liveness() == liveness)
            .cloned()
            .collect();
        selected.sort_by_key(|blob| blob.id());
        selected
    }

    pub fn blob_count(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let blobs = self.blobs.read().unwrap();
        blobs.len()
    }

    // -- Allocation --

    fn next_entry_address(&self, span_len: usize) -> EntryAddress {
        let step = u64::try_from(span_len).unwrap_or(u64::MAX);
        EntryAddress(self.next_address.fetch_add(step, Ordering::Relaxed))
    }

    /// Candidate regions for a freshly compiled blob at `level`.
    fn install_regions(&self, level: CompilationLevel) -> Vec<BlobKind> {
        let preferred = level.preferred_region();
        let mut order = vec![preferred];
        if let Some(sibling) = preferred.sibling_method_region() {
            push_unique(&mut order, sibling);
        }
        if self.config.allow_non_method_fallback {
            push_unique(&mut order, BlobKind::NonMethod);
        }
        order
    }

    /// Candidate regions for a replacement of a blob living in `current`.
    ///
    /// Method regions of another kind come first so that the replacement is
    /// distinguishable by region as well as by id and entry address.
    fn replacement_regions(&self, current: BlobKind, level: CompilationLevel) -> Vec<BlobKind> {
        let preferred = level.preferred_region();
        let mut order = Vec::with_capacity(3);
        for kind in [Some(preferred), preferred.sibling_method_region()]
            .into_iter()
            .flatten()
        {
            if kind != current {
                push_unique(&mut order, kind);
            }
        }
        push_unique(&mut order, current);
        if self.config.allow_non_method_fallback {
            push_unique(&mut order, BlobKind::NonMethod);
        }
        order
    }

    /// Reserve space in the first candidate region that fits and register the
    /// new blob. Nothing is registered when every candidate is full.
    fn allocate(
        &self,
        method: MethodId,
        artifact: CompiledArtifact,
        is_osr: bool,
        candidates: &[BlobKind],
    ) -> Result<Arc<CompiledBlob>> {
        let id = BlobId(self.next_blob_id.fetch_add(1, Ordering::Relaxed));
        let size = artifact.code.len();
        let mut last_error = None;

        for (attempt, kind) in candidates.iter().enumerate() {
            match self.region(*kind).reserve(id, size) {
                Ok(placement) => {
                    if attempt > 0 {
                        CodeCacheMetrics::bump(&self.metrics.region_fallbacks);
                        tracing::warn!(
                            method = %method,
                            blob = %id,
                            region = %kind,
                            size,
                            "Preferred code region full, placed blob in fallback region"
                        );
                    }
                    let entry = self.next_entry_address(placement.len);
                    let blob = Arc::new(CompiledBlob::new(
                        id, method, entry, artifact, is_osr, placement,
                    ));
                    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
                    let mut blobs = self.blobs.write().unwrap();
                    blobs.insert(id, Arc::clone(&blob));
                    return Ok(blob);
                }
                Err(e) if e.is_capacity() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        CodeCacheMetrics::bump(&self.metrics.allocation_failures);
        tracing::warn!(method = %method, size, "No code region can fit compiled blob");
        Err(last_error.unwrap_or(CodeCacheError::RegionCapacity {
            region: candidates.first().copied().unwrap_or(BlobKind::NonMethod),
            requested: size,
            available: 0,
        }))
    }

    // -- Lifecycle operations --

    /// Install a finished artifact as the entrant blob of a method slot.
    ///
    /// The artifact's level must not be lower than the slot's current level.
    /// A previous entrant blob is made non-entrant before the slot is swapped
    /// and stays resident for frames still executing it. Clears the queued
    /// flag on success; on error nothing changes.
    pub fn install_blob(
        &self,
        method: MethodId,
        artifact: CompiledArtifact,
        is_osr: bool,
    ) -> Result<BlobId> {
        let level = artifact.level;
        if !level.is_compiled() {
            return Err(CodeCacheError::InvalidLevel(level));
        }

        let record = self.record_or_insert(method);
        let mut record = write_record(&record);
        let current = record.level(is_osr);
        if level < current {
            return Err(CodeCacheError::LevelDowngrade {
                method,
                is_osr,
                current,
                requested: level,
            });
        }

        let blob = self.allocate(method, artifact, is_osr, &self.install_regions(level))?;
        if record.swap_in(Arc::clone(&blob)).is_some() {
            CodeCacheMetrics::bump(&self.metrics.made_not_entrant);
        }
        record.set_queued(false);
        CodeCacheMetrics::bump(&self.metrics.installs);

        tracing::info!(
            method = %method,
            blob = %blob.id(),
            level = %level,
            is_osr,
            region = %blob.region(),
            entry = %blob.entry_address(),
            "Installed compiled blob"
        );
        Ok(blob.id())
    }

    /// Mark a method as pending compilation. Idempotent.
    pub fn queue_for_compilation(&self, method: MethodId) {
        let record = self.record_or_insert(method);
        let mut record = write_record(&record);
        if !record.is_queued() {
            record.set_queued(true);
            tracing::debug!(method = %method, "Queued method for compilation");
        }
    }

    /// The compiler gave up on a method. Clears the queued flag.
    pub fn notify_compile_failed(&self, method: MethodId) {
        CodeCacheMetrics::bump(&self.metrics.compile_failures);
        if let Some(record) = self.record(method) {
            write_record(&record).set_queued(false);
        }
    }

    /// Force a new blob for a method slot that already has an entrant blob.
    ///
    /// The new blob is regenerated from the current blob's code and always
    /// gets a new id and entry address. The replaced blob becomes non-entrant
    /// but stays resident until a collection finds no frame executing it.
    pub fn replace_entrant_blob(
        &self,
        method: MethodId,
        is_osr: bool,
        options: ReplaceOptions,
    ) -> Result<BlobId> {
        let no_artifact = CodeCacheError::NoCompiledArtifact { method, is_osr };
        let record = self.record(method).ok_or_else(|| no_artifact.clone())?;
        let mut record = write_record(&record);
        let old = record.installed(is_osr).cloned().ok_or(no_artifact)?;

        let level = options.level.unwrap_or(old.level());
        if !level.is_compiled() {
            return Err(CodeCacheError::InvalidLevel(level));
        }
        let candidates = match options.region {
            Some(region) => vec![region],
            None => self.replacement_regions(old.region(), level),
        };

        let artifact = CompiledArtifact {
            level,
            code: old.code().clone(),
        };
        let blob = self.allocate(method, artifact, is_osr, &candidates)?;
        record.swap_in(Arc::clone(&blob));
        CodeCacheMetrics::bump(&self.metrics.made_not_entrant);
        CodeCacheMetrics::bump(&self.metrics.replacements);

        tracing::info!(
            method = %method,
            old_blob = %old.id(),
            new_blob = %blob.id(),
            old_region = %old.region(),
            new_region = %blob.region(),
            level = %level,
            is_osr,
            "Replaced entrant blob"
        );
        Ok(blob.id())
    }

    /// Make the slot's blob non-entrant and leave the slot empty, so the
    /// method runs interpreted until it is compiled again.
    pub fn deoptimize(&self, method: MethodId, is_osr: bool) -> Result<BlobId> {
        let no_artifact = CodeCacheError::NoCompiledArtifact { method, is_osr };
        let record = self.record(method).ok_or_else(|| no_artifact.clone())?;
        let mut record = write_record(&record);
        let blob = record.take(is_osr).ok_or(no_artifact)?;
        if !is_osr {
            self.counter.reset(method);
        }
        CodeCacheMetrics::bump(&self.metrics.made_not_entrant);
        CodeCacheMetrics::bump(&self.metrics.deoptimizations);
        tracing::info!(method = %method, blob = %blob.id(), is_osr, "Deoptimized method");
        Ok(blob.id())
    }

    /// Relocate a resident blob to another region.
    ///
    /// The blob keeps its id and entry address. Fails with `RegionCapacity`
    /// when the target cannot fit it, leaving the blob where it was.
    pub fn move_to_region(&self, id: BlobId, target: BlobKind) -> Result<()> {
        let blob = self.blob(id)?;
        let record = self
            .record(blob.method())
            .ok_or(CodeCacheError::InvalidBlobReference(id))?;
        let _record = write_record(&record);
        // A collection may have reclaimed the blob while we waited for the lock.
        if !self.is_resident(id) {
            return Err(CodeCacheError::InvalidBlobReference(id));
        }

        let source = blob.region();
        if source == target {
            return Ok(());
        }
        CodeRegion::transfer(self.region(source), self.region(target), &blob)?;
        CodeCacheMetrics::bump(&self.metrics.relocations);
        tracing::info!(blob = %id, from = %source, to = %target, "Moved blob to region");
        Ok(())
    }

    // -- Queries --

    /// Queued flag, compiled flag and level of a method slot.
    pub fn query_state(&self, method: MethodId, is_osr: bool) -> MethodState {
        self.record(method)
            .map(|record| read_record(&record).state(is_osr))
            .unwrap_or_default()
    }

    pub fn is_queued(&self, method: MethodId) -> bool {
        self.record(method)
            .map(|record| read_record(&record).is_queued())
            .unwrap_or(false)
    }

    /// Entry address, region and metadata of the slot's entrant blob.
    pub fn describe_blob(&self, method: MethodId, is_osr: bool) -> Result<BlobDescription> {
        let no_artifact = CodeCacheError::NoCompiledArtifact { method, is_osr };
        let record = self.record(method).ok_or_else(|| no_artifact.clone())?;
        let record = read_record(&record);
        record
            .installed(is_osr)
            .map(|blob| blob.describe())
            .ok_or(no_artifact)
    }

    /// Metadata of any resident blob, entrant or not.
    pub fn blob_info(&self, id: BlobId) -> Result<BlobDescription> {
        self.blob(id).map(|blob| blob.describe())
    }

    /// The blob new calls of the method should jump to.
    ///
    /// The returned handle keeps the machine code alive for as long as the
    /// caller holds it, even if the blob is replaced and reclaimed meanwhile.
    pub fn resolve_entry(&self, method: MethodId, is_osr: bool) -> Option<Arc<CompiledBlob>> {
        let record = self.record(method)?;
        let record = read_record(&record);
        record.installed(is_osr).cloned()
    }

    /// Every installation the method went through, oldest first.
    pub fn method_history(&self, method: MethodId) -> Vec<LevelChange> {
        self.record(method)
            .map(|record| read_record(&record).history().to_vec())
            .unwrap_or_default()
    }

    pub fn region_report(&self) -> Vec<RegionReport> {
        self.regions().iter().map(|region| region.report()).collect()
    }

    pub fn resident_blobs(&self, kind: BlobKind) -> Vec<BlobId> {
        self.region(kind).resident_blobs()
    }

    // -- Tiering --

    /// Count an interpreted invocation of `method`.
    ///
    /// Returns `true` when this invocation crossed the compile threshold and
    /// queued the method. Methods that are already queued or have an entrant
    /// standard blob are never re-queued.
    pub fn record_invocation(&self, method: MethodId) -> bool {
        let count = self.counter.increment(method);
        if count < self.config.compile_threshold {
            return false;
        }
        let record = self.record_or_insert(method);
        let mut record = write_record(&record);
        if record.is_queued() || record.installed(false).is_some() {
            return false;
        }
        record.set_queued(true);
        tracing::debug!(method = %method, invocations = count, "Compile threshold reached");
        true
    }

    pub fn invocation_count(&self, method: MethodId) -> u64 {
        self.counter.get(method)
    }

    /// Apply a result delivered by the compiler pipeline.
    ///
    /// Failures are logged and turn into a compile-failure notification so the
    /// method is no longer reported as queued.
    pub fn handle_compiler_event(&self, event: CompilerEvent) -> Option<BlobId> {
        match event {
            CompilerEvent::Completed(result) => {
                let method = result.method;
                let artifact = CompiledArtifact::new(result.level, result.code);
                match self.install_blob(method, artifact, result.is_osr) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(method = %method, error = %e, "Failed to install compiled blob");
                        self.notify_compile_failed(method);
                        None
                    }
                }
            }
            CompilerEvent::Failed { method, reason } => {
                tracing::warn!(method = %method, reason = %reason, "Compilation failed");
                self.notify_compile_failed(method);
                None
            }
        }
    }

    // -- Collection --

    /// Run a full collection pass with the manager's configured policy.
    pub fn collect(&self, frames: &LiveFrames) -> Result<CollectionStats> {
        CollectionTrigger::from_config(&self.config).run(self, frames)
    }

    /// `NonEntrant -> Zombie` for a blob no live frame references.
    pub(crate) fn mark_zombie_if_unreferenced(
        &self,
        blob: &CompiledBlob,
        frames: &LiveFrames,
    ) -> bool {
        let Some(record) = self.record(blob.method()) else {
            return false;
        };
        let record = write_record(&record);
        if record.holds(blob.id()) || frames.contains(blob.entry_address()) {
            return false;
        }
        let marked = blob.make_zombie();
        if marked {
            CodeCacheMetrics::bump(&self.metrics.zombies_marked);
        }
        marked
    }

    /// Remove a zombie blob from the blob table and its region.
    /// Returns the number of bytes released, or `None` if the blob was not a
    /// resident zombie.
    pub(crate) fn reclaim_zombie(&self, blob: &CompiledBlob) -> Result<Option<usize>> {
        let Some(record) = self.record(blob.method()) else {
            return Ok(None);
        };
        let _record = write_record(&record);
        if blob.liveness() != Liveness::Zombie {
            return Ok(None);
        }
        if !self.is_resident(blob.id()) {
            return Ok(None);
        }
        // The region goes first so a failed release leaves the blob registered
        // and still accounted for.
        let region = blob.region();
        self.region(region).release(blob.id())?;
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let mut blobs = self.blobs.write().unwrap();
            blobs.remove(&blob.id());
        }

        let size = blob.size();
        CodeCacheMetrics::bump(&self.metrics.blobs_reclaimed);
        CodeCacheMetrics::add(
            &self.metrics.bytes_reclaimed,
            u64::try_from(size).unwrap_or(u64::MAX),
        );
        tracing::debug!(blob = %blob.id(), method = %blob.method(), region = %region, size, "Reclaimed zombie blob");
        Ok(Some(size))
    }

    pub(crate) fn note_collection(&self) {
        CodeCacheMetrics::bump(&self.metrics.collections);
    }

    /// Verify region accounting against the blob table.
    ///
    /// Checks that every region's used bytes equal the sum of its residents'
    /// sizes, that every resident is in the blob table under the same region,
    /// and that every blob in the table is resident somewhere. Meant for
    /// quiescent points; concurrent mutations may produce false reports.
    pub fn check_invariants(&self) -> Result<()> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let blobs = self.blobs.read().unwrap();
        let mut resident_total = 0usize;

        for region in self.regions() {
            let residents = region.resident_sizes();
            let sum: usize = residents.iter().map(|(_, size)| *size).sum();
            let used = region.used_bytes();
            if sum != used {
                return Err(CodeCacheError::InvariantViolation(format!(
                    "{} region reports {used} used bytes but residents sum to {sum}",
                    region.kind()
                )));
            }
            for (id, size) in &residents {
                let blob = blobs.get(id).ok_or_else(|| {
                    CodeCacheError::InvariantViolation(format!(
                        "{id} is resident in the {} region but not registered",
                        region.kind()
                    ))
                })?;
                if blob.region() != region.kind() || blob.size() != *size {
                    return Err(CodeCacheError::InvariantViolation(format!(
                        "{id} placement disagrees with the {} region",
                        region.kind()
                    )));
                }
            }
            resident_total = resident_total.saturating_add(residents.len());
        }

        if resident_total != blobs.len() {
            return Err(CodeCacheError::InvariantViolation(format!(
                "{} registered blobs but {resident_total} resident",
                blobs.len()
            )));
        }
        Ok(())
    }
}

impl Default for CodeCacheManager {
    fn default() -> Self {
        Self::build(CodeCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(level: CompilationLevel, size: usize) -> CompiledArtifact {
        CompiledArtifact::new(level, vec![0x90u8; size])
    }

    #[test]
    fn test_unknown_method_reports_not_compiled() {
        let manager = CodeCacheManager::default();
        for is_osr in [false, true] {
            assert_eq!(
                manager.query_state(MethodId(1), is_osr),
                MethodState {
                    queued: false,
                    compiled: false,
                    level: CompilationLevel::None,
                }
            );
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = CodeCacheConfig {
            compile_threshold: 0,
            ..Default::default()
        };
        assert!(matches!(
            CodeCacheManager::new(config),
            Err(CodeCacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_install_reports_level_and_region() {
        let manager = CodeCacheManager::default();
        let method = MethodId(1);
        manager.queue_for_compilation(method);
        assert!(manager.query_state(method, false).queued);

        let id = manager
            .install_blob(method, artifact(CompilationLevel::Tier3, 100), false)
            .expect("install");

        let state = manager.query_state(method, false);
        assert!(!state.queued);
        assert!(state.compiled);
        assert_eq!(state.level, CompilationLevel::Tier3);

        let desc = manager.describe_blob(method, false).expect("installed");
        assert_eq!(desc.blob_id, id);
        assert_eq!(desc.region, BlobKind::Profiled);
        assert!(desc.entry_address.0 >= CODE_SPACE_BASE);
        assert_eq!(manager.resident_blobs(BlobKind::Profiled), vec![id]);
    }

    #[test]
    fn test_install_rejects_downgrade_and_none() {
        let manager = CodeCacheManager::default();
        let method = MethodId(1);
        manager
            .install_blob(method, artifact(CompilationLevel::Tier4, 64), false)
            .expect("install");

        let err = manager
            .install_blob(method, artifact(CompilationLevel::Tier2, 64), false)
            .unwrap_err();
        assert_eq!(
            err,
            CodeCacheError::LevelDowngrade {
                method,
                is_osr: false,
                current: CompilationLevel::Tier4,
                requested: CompilationLevel::Tier2,
            }
        );
        assert_eq!(
            manager
                .install_blob(method, artifact(CompilationLevel::None, 8), false)
                .unwrap_err(),
            CodeCacheError::InvalidLevel(CompilationLevel::None)
        );
        assert_eq!(manager.blob_count(), 1);
        assert_eq!(manager.query_state(method, false).level, CompilationLevel::Tier4);
    }

    #[test]
    fn test_upgrade_makes_previous_non_entrant() {
        let manager = CodeCacheManager::default();
        let method = MethodId(1);
        let first = manager
            .install_blob(method, artifact(CompilationLevel::Tier3, 64), false)
            .expect("install");
        let second = manager
            .install_blob(method, artifact(CompilationLevel::Tier4, 64), false)
            .expect("install");

        assert_eq!(
            manager.blob_info(first).expect("still resident").liveness,
            Liveness::NonEntrant
        );
        assert_eq!(manager.describe_blob(method, false).expect("installed").blob_id, second);
        assert_eq!(manager.method_history(method).len(), 2);
    }

    #[test]
    fn test_osr_and_standard_slots_are_independent() {
        let manager = CodeCacheManager::default();
        let method = MethodId(3);
        manager
            .install_blob(method, artifact(CompilationLevel::Tier3, 32), true)
            .expect("install osr");

        assert!(manager.query_state(method, true).compiled);
        assert!(!manager.query_state(method, false).compiled);
        assert!(manager.describe_blob(method, true).expect("osr").is_osr);
        assert!(matches!(
            manager.describe_blob(method, false),
            Err(CodeCacheError::NoCompiledArtifact { is_osr: false, .. })
        ));
    }

    #[test]
    fn test_install_falls_back_when_preferred_region_full() {
        let config = CodeCacheConfig {
            non_profiled_capacity: 64,
            ..Default::default()
        };
        let manager = CodeCacheManager::new(config).expect("valid config");
        manager
            .install_blob(MethodId(1), artifact(CompilationLevel::Tier4, 64), false)
            .expect("fits preferred");
        manager
            .install_blob(MethodId(2), artifact(CompilationLevel::Tier4, 64), false)
            .expect("falls back");

        let desc = manager.describe_blob(MethodId(2), false).expect("installed");
        assert_eq!(desc.region, BlobKind::Profiled);
        assert_eq!(manager.metrics().snapshot().region_fallbacks, 1);
    }

    #[test]
    fn test_install_fails_when_every_region_full() {
        let config = CodeCacheConfig {
            profiled_capacity: 32,
            non_profiled_capacity: 32,
            non_method_capacity: 32,
            ..Default::default()
        };
        let manager = CodeCacheManager::new(config).expect("valid config");
        manager.queue_for_compilation(MethodId(1));

        let err = manager
            .install_blob(MethodId(1), artifact(CompilationLevel::Tier4, 64), false)
            .unwrap_err();
        assert!(err.is_capacity());
        let state = manager.query_state(MethodId(1), false);
        assert!(state.queued, "failed install leaves the queued flag alone");
        assert!(!state.compiled);
        assert_eq!(manager.blob_count(), 0);
        assert_eq!(manager.metrics().snapshot().allocation_failures, 1);
    }

    #[test]
    fn test_queue_is_idempotent_and_cleared_by_failure() {
        let manager = CodeCacheManager::default();
        let method = MethodId(5);
        manager.queue_for_compilation(method);
        manager.queue_for_compilation(method);
        assert!(manager.is_queued(method));

        manager.notify_compile_failed(method);
        assert!(!manager.is_queued(method));
        assert_eq!(manager.metrics().snapshot().compile_failures, 1);
    }

    #[test]
    fn test_deoptimize_empties_slot() {
        let manager = CodeCacheManager::default();
        let method = MethodId(1);
        let id = manager
            .install_blob(method, artifact(CompilationLevel::Tier4, 64), false)
            .expect("install");

        assert_eq!(manager.deoptimize(method, false), Ok(id));
        assert_eq!(manager.query_state(method, false), MethodState::default());
        assert_eq!(
            manager.blob_info(id).expect("resident").liveness,
            Liveness::NonEntrant
        );
        assert!(matches!(
            manager.deoptimize(method, false),
            Err(CodeCacheError::NoCompiledArtifact { .. })
        ));

        // Lower tiers may be installed again after deoptimization.
        manager
            .install_blob(method, artifact(CompilationLevel::Tier1, 16), false)
            .expect("reinstall at lower tier");
    }

    #[test]
    fn test_record_invocation_queues_at_threshold() {
        let config = CodeCacheConfig {
            compile_threshold: 3,
            ..Default::default()
        };
        let manager = CodeCacheManager::new(config).expect("valid config");
        let method = MethodId(1);

        assert!(!manager.record_invocation(method));
        assert!(!manager.record_invocation(method));
        assert!(manager.record_invocation(method));
        assert!(!manager.record_invocation(method), "already queued");
        assert!(manager.is_queued(method));

        manager
            .install_blob(method, artifact(CompilationLevel::Tier3, 16), false)
            .expect("install");
        assert!(!manager.record_invocation(method), "already compiled");
        assert_eq!(manager.invocation_count(method), 5);
    }

    #[test]
    fn test_move_to_region_keeps_identity() {
        let manager = CodeCacheManager::default();
        let id = manager
            .install_blob(MethodId(1), artifact(CompilationLevel::Tier3, 80), false)
            .expect("install");
        let before = manager.blob_info(id).expect("resident");

        manager
            .move_to_region(id, BlobKind::NonMethod)
            .expect("non-method region has space");

        let after = manager.blob_info(id).expect("resident");
        assert_eq!(after.region, BlobKind::NonMethod);
        assert_eq!(after.entry_address, before.entry_address);
        assert_eq!(manager.region(BlobKind::Profiled).used_bytes(), 0);
        assert_eq!(manager.region(BlobKind::NonMethod).used_bytes(), 80);
        assert!(manager.query_state(MethodId(1), false).compiled);
        manager.check_invariants().expect("accounting holds");
    }

    #[test]
    fn test_move_to_full_region_fails() {
        let config = CodeCacheConfig {
            non_method_capacity: 16,
            ..Default::default()
        };
        let manager = CodeCacheManager::new(config).expect("valid config");
        let id = manager
            .install_blob(MethodId(1), artifact(CompilationLevel::Tier4, 64), false)
            .expect("install");

        let err = manager.move_to_region(id, BlobKind::NonMethod).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(manager.blob_info(id).expect("resident").region, BlobKind::NonProfiled);
        assert_eq!(
            manager.move_to_region(BlobId(999), BlobKind::NonMethod),
            Err(CodeCacheError::InvalidBlobReference(BlobId(999)))
        );
    }

    #[test]
    fn test_region_report_lists_all_regions() {
        let manager = CodeCacheManager::default();
        manager
            .install_blob(MethodId(1), artifact(CompilationLevel::Tier2, 10), false)
            .expect("install");
        let report = manager.region_report();
        assert_eq!(report.len(), 3);
        let profiled = report
            .iter()
            .find(|r| r.region == BlobKind::Profiled)
            .expect("profiled region reported");
        assert_eq!(profiled.used_bytes, 10);
        assert_eq!(profiled.blob_count, 1);
        assert_eq!(profiled.capacity_bytes, manager.config().profiled_capacity);
    }

    #[test]
    fn test_handle_compiler_events() {
        use crate::compiler_thread::CompileResult;

        let manager = CodeCacheManager::default();
        let method = MethodId(8);
        manager.queue_for_compilation(method);
        let id = manager.handle_compiler_event(CompilerEvent::Completed(CompileResult {
            method,
            level: CompilationLevel::Tier4,
            code: vec![0x90u8; 24].into(),
            is_osr: false,
        }));
        assert!(id.is_some());
        assert!(!manager.is_queued(method));

        manager.queue_for_compilation(MethodId(9));
        let none = manager.handle_compiler_event(CompilerEvent::Failed {
            method: MethodId(9),
            reason: "bailout".to_string(),
        });
        assert!(none.is_none());
        assert!(!manager.is_queued(MethodId(9)));
    }

    #[test]
    fn test_introspection_serializes_to_json() {
        let manager = CodeCacheManager::default();
        let method = MethodId(4);
        manager
            .install_blob(method, artifact(CompilationLevel::Tier1, 40), true)
            .expect("install");

        let report = serde_json::to_value(manager.region_report()).expect("serializable");
        assert_eq!(report[1]["region"], "non-profiled");
        assert_eq!(report[1]["used_bytes"], 40);

        let desc = serde_json::to_value(manager.describe_blob(method, true).expect("installed"))
            .expect("serializable");
        assert_eq!(desc["level"], "Tier1");
        assert_eq!(desc["is_osr"], true);
        assert_eq!(desc["liveness"], "entrant");

        let metrics = serde_json::to_value(manager.metrics().snapshot()).expect("serializable");
        assert_eq!(metrics["installs"], 1);
    }

    #[test]
    fn test_failed_reclaim_keeps_blob_registered() {
        let manager = CodeCacheManager::default();
        let id = manager
            .install_blob(MethodId(1), artifact(CompilationLevel::Tier4, 64), false)
            .expect("install");
        manager.deoptimize(MethodId(1), false).expect("deoptimize");
        let blob = manager.blob(id).expect("resident");
        assert!(manager.mark_zombie_if_unreferenced(&blob, &LiveFrames::new()));

        // Drop the region bookkeeping behind the manager's back.
        manager
            .region(BlobKind::NonProfiled)
            .release(id)
            .expect("resident in region");

        assert_eq!(
            manager.reclaim_zombie(&blob),
            Err(CodeCacheError::InvalidBlobReference(id))
        );
        assert!(manager.blob(id).is_ok(), "blob stays registered after a failed release");
        assert_eq!(manager.metrics().snapshot().blobs_reclaimed, 0);
    }
}
