//! Compiled blobs.
//!
//! A blob is the machine code for one method at one tier together with the
//! metadata the cache needs to dispatch to it and eventually reclaim it.
//! Everything except liveness and placement is fixed at creation.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use serde::Serialize;

use crate::region::Placement;
use crate::types::{BlobId, BlobKind, CompilationLevel, EntryAddress, MethodId};

/// Lifecycle state of a blob.
///
/// Transitions only move forward one step at a time:
/// `Entrant -> NonEntrant -> Zombie`. Removal happens once a zombie is
/// reclaimed; a removed blob is no longer visible through the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Liveness {
    /// Chosen for new calls to its method.
    Entrant,
    /// No longer chosen for new calls; frames may still execute it.
    NonEntrant,
    /// Confirmed unreferenced by any frame, waiting for reclamation.
    Zombie,
}

impl Liveness {
    fn to_raw(self) -> u8 {
        match self {
            Liveness::Entrant => 0,
            Liveness::NonEntrant => 1,
            Liveness::Zombie => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Liveness::Entrant,
            1 => Liveness::NonEntrant,
            _ => Liveness::Zombie,
        }
    }
}

/// Finished compiler output handed to the manager for installation.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub level: CompilationLevel,
    pub code: Bytes,
}

impl CompiledArtifact {
    pub fn new(level: CompilationLevel, code: impl Into<Bytes>) -> Self {
        Self {
            level,
            code: code.into(),
        }
    }
}

/// Machine code plus metadata, resident in exactly one region.
#[derive(Debug)]
pub struct CompiledBlob {
    id: BlobId,
    method: MethodId,
    entry: EntryAddress,
    level: CompilationLevel,
    is_osr: bool,
    code: Bytes,
    liveness: AtomicU8,
    placement: RwLock<Placement>,
}

impl CompiledBlob {
    pub(crate) fn new(
        id: BlobId,
        method: MethodId,
        entry: EntryAddress,
        artifact: CompiledArtifact,
        is_osr: bool,
        placement: Placement,
    ) -> Self {
        Self {
            id,
            method,
            entry,
            level: artifact.level,
            is_osr,
            code: artifact.code,
            liveness: AtomicU8::new(Liveness::Entrant.to_raw()),
            placement: RwLock::new(placement),
        }
    }

    pub fn id(&self) -> BlobId {
        self.id
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn entry_address(&self) -> EntryAddress {
        self.entry
    }

    pub fn level(&self) -> CompilationLevel {
        self.level
    }

    pub fn is_osr(&self) -> bool {
        self.is_osr
    }

    /// Machine code bytes. Holding the returned handle keeps the code alive
    /// after the blob has been reclaimed from its region.
    pub fn code(&self) -> &Bytes {
        &self.code
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_raw(self.liveness.load(Ordering::Acquire))
    }

    pub fn is_entrant(&self) -> bool {
        self.liveness() == Liveness::Entrant
    }

    pub fn placement(&self) -> Placement {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let placement = self.placement.read().unwrap();
        *placement
    }

    pub fn region(&self) -> BlobKind {
        self.placement().region
    }

    /// `Entrant -> NonEntrant`. Returns `false` if the blob was not entrant.
    pub(crate) fn make_not_entrant(&self) -> bool {
        self.transition(Liveness::Entrant, Liveness::NonEntrant)
    }

    /// `NonEntrant -> Zombie`. Returns `false` if the blob was not non-entrant.
    pub(crate) fn make_zombie(&self) -> bool {
        self.transition(Liveness::NonEntrant, Liveness::Zombie)
    }

    fn transition(&self, from: Liveness, to: Liveness) -> bool {
        let moved = self
            .liveness
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!(blob = %self.id, method = %self.method, from = ?from, to = ?to, "Blob liveness changed");
        }
        moved
    }

    /// Only called by the region transfer, which holds both region locks.
    pub(crate) fn set_placement(&self, placement: Placement) {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut guard = self.placement.write().unwrap();
        *guard = placement;
    }

    pub fn describe(&self) -> BlobDescription {
        BlobDescription {
            blob_id: self.id,
            method: self.method,
            entry_address: self.entry,
            region: self.region(),
            level: self.level,
            is_osr: self.is_osr,
            size: self.size(),
            liveness: self.liveness(),
        }
    }
}

/// Introspection view of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlobDescription {
    pub blob_id: BlobId,
    pub method: MethodId,
    pub entry_address: EntryAddress,
    pub region: BlobKind,
    pub level: CompilationLevel,
    pub is_osr: bool,
    pub size: usize,
    pub liveness: Liveness,
}
