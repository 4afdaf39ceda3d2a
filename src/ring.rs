//! Ring memory: one anonymous mapping per independent stream chain.
//!
//! A ring maps `map_length + overhang` bytes. Cursors are monotonically
//! increasing byte totals and land at `total % map_length`. The overhang
//! aliases the start of the ring so any span of at most `overhang` bytes is
//! contiguous: every commit copies the bytes it touched between the two
//! aliases, keeping `[0, overhang)` and `[map_length, map_length + overhang)`
//! identical for all committed data.

use crate::error::{Error, Result};
use crate::invariant_ppt::{invariant_violation, RING_COHERENT};
use memmap2::MmapMut;

/// Handle to a ring within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingId(pub usize);

/// A mapped ring buffer.
///
/// Readers and writers on different workers touch disjoint regions of the
/// same mapping through `base`. Exclusion comes from the cursor protocol,
/// not from Rust borrows; `_map` only owns the memory.
pub struct Ring {
    base: *mut u8,
    _map: MmapMut,
    map_length: usize,
    overhang: usize,
}

impl Ring {
    /// Map a ring. `overhang` must not exceed `map_length`.
    pub fn new(map_length: usize, overhang: usize) -> Result<Self> {
        let invalid = |len: usize, detail: String| Error::Map {
            len,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, detail),
        };
        let len = map_length.checked_add(overhang).ok_or_else(|| {
            invalid(
                usize::MAX,
                format!("map length {map_length} plus overhang {overhang} overflows"),
            )
        })?;
        if map_length == 0 || overhang > map_length {
            return Err(invalid(
                len,
                format!("overhang {overhang} does not fit map length {map_length}"),
            ));
        }
        let mut map = MmapMut::map_anon(len).map_err(|source| Error::Map { len, source })?;
        tracing::debug!(map_length, overhang, "mapped ring");
        Ok(Self {
            base: map.as_mut_ptr(),
            _map: map,
            map_length,
            overhang,
        })
    }

    pub fn map_length(&self) -> usize {
        self.map_length
    }

    pub fn overhang(&self) -> usize {
        self.overhang
    }

    /// Total bytes mapped, overhang included.
    pub fn mapped_len(&self) -> usize {
        self.map_length + self.overhang
    }

    /// Physical offset of a cursor total.
    pub fn offset(&self, total: usize) -> usize {
        total % self.map_length
    }

    /// Pointer to the span starting at cursor `total`.
    ///
    /// Panics if `len` exceeds the overhang, since the span would run past
    /// the end of the mapping.
    pub(crate) fn span_ptr(&self, total: usize, len: usize) -> *mut u8 {
        if len > self.overhang {
            invariant_violation(
                RING_COHERENT,
                "span longer than the ring overhang",
                &format!("len {len}, overhang {}", self.overhang),
            );
        }
        let offset = self.offset(total);
        // SAFETY: offset + len <= map_length + overhang, the mapped length.
        unsafe { self.base().add(offset) }
    }

    /// Copy the committed span `[total, total + len)` between aliases.
    pub(crate) fn commit(&self, total: usize, len: usize) {
        if len == 0 {
            return;
        }
        if len > self.overhang {
            invariant_violation(
                RING_COHERENT,
                "commit longer than the ring overhang",
                &format!("len {len}, overhang {}", self.overhang),
            );
        }
        let start = self.offset(total);
        let end = start + len;
        let base = self.base();
        // SAFETY: both ranges lie inside the mapping. Source and destination
        // are map_length apart and len <= overhang <= map_length, so they
        // never overlap. The bytes belong to the committing port until its
        // cursor is published.
        unsafe {
            if end > self.map_length {
                let from = start.max(self.map_length);
                std::ptr::copy_nonoverlapping(
                    base.add(from),
                    base.add(from - self.map_length),
                    end - from,
                );
            }
            if start < self.overhang {
                let to = end.min(self.overhang);
                std::ptr::copy_nonoverlapping(
                    base.add(start),
                    base.add(start + self.map_length),
                    to - start,
                );
            }
        }
    }

    fn base(&self) -> *mut u8 {
        self.base
    }

    #[cfg(test)]
    fn write(&self, total: usize, data: &[u8]) {
        let ptr = self.span_ptr(total, data.len());
        // SAFETY: test-only exclusive access.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        self.commit(total, data.len());
    }

    #[cfg(test)]
    fn read(&self, total: usize, len: usize) -> Vec<u8> {
        let ptr = self.span_ptr(total, len);
        // SAFETY: test-only, no concurrent writer.
        unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
    }
}

// SAFETY: the mapping is shared by the workers of one run. Each byte range
// is written by exactly one port between cursor publications (release on
// the writer, acquire on the reader), and rings are dropped only after every
// worker has been joined. `base` stays valid as long as `_map` lives, and
// moving the `MmapMut` does not move the mapping.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("map_length", &self.map_length)
            .field("overhang", &self.overhang)
            .finish()
    }
}
