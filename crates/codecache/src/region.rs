//! Code regions.
//!
//! Each region is an arena dedicated to one [`BlobKind`]. Space is handed out
//! first-fit from a free list (bounded by a probe count) and otherwise bumped
//! from the top of the arena. Released spans are coalesced with their
//! neighbours and the top is lowered when the highest span is freed.
//!
//! All bookkeeping sits behind a single `Mutex`, so reservations and releases
//! against one region are linearizable and `used_bytes()` never observes a
//! half-applied update.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::blob::CompiledBlob;
use crate::error::{CodeCacheError, Result};
use crate::types::{BlobId, BlobKind};

/// Arena spans are aligned to this many bytes.
pub const CODE_ALIGNMENT: usize = 32;

/// Round `size` up to the arena alignment. Zero-sized code still occupies one
/// aligned span so that every resident blob has a distinct offset.
pub fn align_code_size(size: usize) -> Option<usize> {
    let mask = CODE_ALIGNMENT.saturating_sub(1);
    size.max(1).checked_add(mask).map(|v| v & !mask)
}

/// Where a blob lives inside its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub region: BlobKind,
    /// Offset of the span from the start of the arena.
    pub offset: usize,
    /// Aligned span length.
    pub len: usize,
}

/// Aggregate view of a region for introspection clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionReport {
    pub region: BlobKind,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub blob_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: usize,
    len: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.offset.saturating_add(self.len)
    }
}

#[derive(Debug, Clone, Copy)]
struct Resident {
    span: Span,
    size: usize,
}

#[derive(Debug, Default)]
struct RegionInner {
    /// Sum of resident blob sizes.
    used: usize,
    /// First offset never handed out by bump allocation.
    top: usize,
    /// Free spans below `top`, sorted by offset, never adjacent.
    free: Vec<Span>,
    residents: BTreeMap<BlobId, Resident>,
}

impl RegionInner {
    fn reserve(
        &mut self,
        kind: BlobKind,
        capacity: usize,
        max_probes: usize,
        blob: BlobId,
        size: usize,
    ) -> Result<Placement> {
        if self.residents.contains_key(&blob) {
            return Err(CodeCacheError::InvariantViolation(format!(
                "{blob} is already resident in the {kind} region"
            )));
        }

        let available = capacity.saturating_sub(self.used);
        let capacity_error = CodeCacheError::RegionCapacity {
            region: kind,
            requested: size,
            available,
        };
        if size > available {
            return Err(capacity_error);
        }
        let len = align_code_size(size).ok_or_else(|| capacity_error.clone())?;

        let offset = match self
            .free
            .iter()
            .take(max_probes)
            .position(|span| span.len >= len)
        {
            Some(index) => self.take_from_free(index, len).ok_or(capacity_error)?,
            None => {
                let end = self.top.checked_add(len).filter(|end| *end <= capacity);
                let Some(end) = end else {
                    return Err(capacity_error);
                };
                let offset = self.top;
                self.top = end;
                offset
            }
        };

        let span = Span { offset, len };
        self.residents.insert(blob, Resident { span, size });
        self.used = self.used.saturating_add(size);
        Ok(Placement {
            region: kind,
            offset,
            len,
        })
    }

    fn take_from_free(&mut self, index: usize, len: usize) -> Option<usize> {
        let span = self.free.get_mut(index)?;
        let offset = span.offset;
        if span.len == len {
            self.free.remove(index);
        } else {
            span.offset = span.offset.saturating_add(len);
            span.len = span.len.saturating_sub(len);
        }
        Some(offset)
    }

    fn release(&mut self, blob: BlobId) -> Result<Resident> {
        let resident = self
            .residents
            .remove(&blob)
            .ok_or(CodeCacheError::InvalidBlobReference(blob))?;
        self.used = self.used.saturating_sub(resident.size);
        self.free_span(resident.span);
        Ok(resident)
    }

    fn free_span(&mut self, span: Span) {
        let index = match self
            .free
            .binary_search_by_key(&span.offset, |s| s.offset)
        {
            Ok(index) | Err(index) => index,
        };
        self.free.insert(index, span);

        // Merge with the following span.
        let next_offset = self.free.get(index.saturating_add(1)).map(|s| s.offset);
        if next_offset == Some(span.end()) {
            let next = self.free.remove(index.saturating_add(1));
            if let Some(current) = self.free.get_mut(index) {
                current.len = current.len.saturating_add(next.len);
            }
        }

        // Merge with the preceding span.
        if index > 0 {
            let prev_index = index.saturating_sub(1);
            let prev_end = self.free.get(prev_index).map(Span::end);
            if prev_end == Some(span.offset) {
                let current = self.free.remove(index);
                if let Some(prev) = self.free.get_mut(prev_index) {
                    prev.len = prev.len.saturating_add(current.len);
                }
            }
        }

        while let Some(last) = self.free.last().copied() {
            if last.end() != self.top {
                break;
            }
            self.top = last.offset;
            self.free.pop();
        }
    }

    fn free_bytes(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.used)
    }
}

/// A code heap segment holding blobs of one kind.
#[derive(Debug)]
pub struct CodeRegion {
    kind: BlobKind,
    capacity: usize,
    max_fit_probes: usize,
    inner: Mutex<RegionInner>,
}

impl CodeRegion {
    pub fn new(kind: BlobKind, capacity: usize, max_fit_probes: usize) -> Self {
        Self {
            kind,
            capacity,
            max_fit_probes: max_fit_probes.max(1),
            inner: Mutex::new(RegionInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegionInner> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let guard = self.inner.lock().unwrap();
        guard
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    /// Reserve space for `blob`. Fails fast with `RegionCapacity` when no span
    /// fits; never waits for space to be released.
    pub fn reserve(&self, blob: BlobId, size: usize) -> Result<Placement> {
        let mut inner = self.lock();
        inner.reserve(self.kind, self.capacity, self.max_fit_probes, blob, size)
    }

    /// Drop the bookkeeping for `blob`. Accounting is updated before the lock
    /// is released.
    pub fn release(&self, blob: BlobId) -> Result<Placement> {
        let mut inner = self.lock();
        let resident = inner.release(blob)?;
        Ok(Placement {
            region: self.kind,
            offset: resident.span.offset,
            len: resident.span.len,
        })
    }

    /// Move `blob` from `from` to `to` under both region locks.
    ///
    /// Locks are taken in [`BlobKind`] order. The blob is never resident in
    /// both regions, and on failure it stays where it was.
    pub fn transfer(from: &CodeRegion, to: &CodeRegion, blob: &CompiledBlob) -> Result<Placement> {
        if from.kind == to.kind {
            return Ok(blob.placement());
        }
        let from_first = from.kind.index() < to.kind.index();
        let (mut first, mut second) = if from_first {
            (from.lock(), to.lock())
        } else {
            (to.lock(), from.lock())
        };
        let (src, dst): (&mut RegionInner, &mut RegionInner) = if from_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        if !src.residents.contains_key(&blob.id()) {
            return Err(CodeCacheError::InvalidBlobReference(blob.id()));
        }
        let placement = dst.reserve(
            to.kind,
            to.capacity,
            to.max_fit_probes,
            blob.id(),
            blob.size(),
        )?;
        src.release(blob.id())?;
        blob.set_placement(placement);
        Ok(placement)
    }

    pub fn used_bytes(&self) -> usize {
        self.lock().used
    }

    pub fn free_bytes(&self) -> usize {
        self.lock().free_bytes(self.capacity)
    }

    pub fn blob_count(&self) -> usize {
        self.lock().residents.len()
    }

    pub fn contains(&self, blob: BlobId) -> bool {
        self.lock().residents.contains_key(&blob)
    }

    /// Resident blob ids in ascending order.
    pub fn resident_blobs(&self) -> Vec<BlobId> {
        self.lock().residents.keys().copied().collect()
    }

    /// Resident blob ids with the size recorded at reservation.
    pub fn resident_sizes(&self) -> Vec<(BlobId, usize)> {
        self.lock()
            .residents
            .iter()
            .map(|(id, resident)| (*id, resident.size))
            .collect()
    }

    /// Used bytes as a percentage of capacity. Empty-capacity regions report 100.
    pub fn occupancy_percent(&self) -> usize {
        let used = self.used_bytes();
        if self.capacity == 0 {
            return 100;
        }
        used.saturating_mul(100) / self.capacity
    }

    /// Whether this region is filled to a strictly higher fraction of its
    /// capacity than `other`. Compares exact byte ratios, not rounded
    /// percentages.
    pub fn is_denser_than(&self, other: &CodeRegion) -> bool {
        let (ours, theirs) = (self.used_bytes(), other.used_bytes());
        ours.saturating_mul(other.capacity) > theirs.saturating_mul(self.capacity)
    }

    pub fn report(&self) -> RegionReport {
        let inner = self.lock();
        RegionReport {
            region: self.kind,
            used_bytes: inner.used,
            capacity_bytes: self.capacity,
            blob_count: inner.residents.len(),
        }
    }
}
