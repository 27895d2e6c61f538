//! Per-method compilation state.
//!
//! A [`MethodRecord`] holds the queued flag and two independent slots, one for
//! the standard entry and one for the on-stack-replacement entry. The manager
//! wraps every record in its own `RwLock`; the record itself is plain data and
//! only the manager mutates it.

use std::sync::Arc;

use serde::Serialize;

use crate::blob::CompiledBlob;
use crate::types::{BlobId, CompilationLevel, MethodId, MethodState};

/// One installation in a method's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelChange {
    pub blob: BlobId,
    pub level: CompilationLevel,
    pub is_osr: bool,
}

#[derive(Debug)]
pub struct MethodRecord {
    method: MethodId,
    queued: bool,
    standard: Option<Arc<CompiledBlob>>,
    osr: Option<Arc<CompiledBlob>>,
    history: Vec<LevelChange>,
}

impl MethodRecord {
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            queued: false,
            standard: None,
            osr: None,
            history: Vec::new(),
        }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub(crate) fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    fn slot(&self, is_osr: bool) -> &Option<Arc<CompiledBlob>> {
        if is_osr { &self.osr } else { &self.standard }
    }

    fn slot_mut(&mut self, is_osr: bool) -> &mut Option<Arc<CompiledBlob>> {
        if is_osr {
            &mut self.osr
        } else {
            &mut self.standard
        }
    }

    /// The entrant blob for the slot, if any.
    pub fn installed(&self, is_osr: bool) -> Option<&Arc<CompiledBlob>> {
        self.slot(is_osr).as_ref().filter(|blob| blob.is_entrant())
    }

    /// Level of the entrant blob for the slot, `None` when the slot is empty.
    pub fn level(&self, is_osr: bool) -> CompilationLevel {
        self.installed(is_osr)
            .map(|blob| blob.level())
            .unwrap_or_default()
    }

    /// Consistent view of one slot. `compiled` and `level` come from the same
    /// blob read, so a compiled slot never reports level `None`.
    pub fn state(&self, is_osr: bool) -> MethodState {
        let installed = self.installed(is_osr);
        MethodState {
            queued: self.queued,
            compiled: installed.is_some(),
            level: installed.map(|blob| blob.level()).unwrap_or_default(),
        }
    }

    pub fn history(&self) -> &[LevelChange] {
        &self.history
    }

    /// Install `blob` into its slot.
    ///
    /// The previous occupant is made non-entrant before the slot is rewritten.
    /// Returns the previous occupant.
    pub(crate) fn swap_in(&mut self, blob: Arc<CompiledBlob>) -> Option<Arc<CompiledBlob>> {
        let is_osr = blob.is_osr();
        if let Some(previous) = self.slot(is_osr) {
            previous.make_not_entrant();
        }
        self.history.push(LevelChange {
            blob: blob.id(),
            level: blob.level(),
            is_osr,
        });
        self.slot_mut(is_osr).replace(blob)
    }

    /// Make the slot's blob non-entrant and empty the slot.
    pub(crate) fn take(&mut self, is_osr: bool) -> Option<Arc<CompiledBlob>> {
        let blob = self.slot_mut(is_osr).take()?;
        blob.make_not_entrant();
        Some(blob)
    }

    /// Whether either slot currently points at `blob`.
    pub fn holds(&self, blob: BlobId) -> bool {
        [&self.standard, &self.osr]
            .into_iter()
            .flatten()
            .any(|installed| installed.id() == blob)
    }
}
