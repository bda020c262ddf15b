/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The cross-chunk placement policy: allocate, reallocate, free.

use log::debug;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::{Diagnostic, DiagnosticSink, LoggingDiagnosticSink, ResizeStatus};
use crate::slice::Slice;
use crate::{CHUNK_MAXIMUM_CAPACITY, CHUNK_MINIMUM_CAPACITY};

/// Configuration for a [`VirtualMemory`] instance.
///
/// `initial_capacity` seeds the first chunk (rounded up to a power of two,
/// at least [`CHUNK_MINIMUM_CAPACITY`]; `0` is valid and simply means the
/// instance starts with no chunks, growing one on the first `alloc`).
/// `diagnostic_sink` lets an embedder redirect the handful of diagnostics
/// this crate reports (see [`crate::error::Diagnostic`]) into its own error
/// log instead of the process log.
pub struct VirtualMemoryConfig {
    pub initial_capacity: u32,
    pub diagnostic_sink: Rc<dyn DiagnosticSink>,
}

impl Default for VirtualMemoryConfig {
    fn default() -> VirtualMemoryConfig {
        VirtualMemoryConfig {
            initial_capacity: 0,
            diagnostic_sink: Rc::new(LoggingDiagnosticSink),
        }
    }
}

impl std::fmt::Debug for VirtualMemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMemoryConfig")
            .field("initial_capacity", &self.initial_capacity)
            .finish_non_exhaustive()
    }
}

/// Smallest power of two `≥ max(n, CHUNK_MINIMUM_CAPACITY)`, saturating at
/// [`CHUNK_MAXIMUM_CAPACITY`] instead of wrapping when `n` is large enough
/// that the ideal power of two would not fit in a `u32`.
pub fn next_power_of_two(n: u32) -> u32 {
    if n >= CHUNK_MAXIMUM_CAPACITY {
        return CHUNK_MAXIMUM_CAPACITY;
    }
    let mut capacity: u64 = CHUNK_MINIMUM_CAPACITY as u64;
    while capacity < n as u64 {
        capacity *= 2;
    }
    capacity.min(CHUNK_MAXIMUM_CAPACITY as u64) as u32
}

/// Owns an ordered list of [`Chunk`]s and implements the allocate /
/// reallocate / free placement policy across them.
///
/// Single-threaded by construction: every method takes `&mut self`, and
/// [`Slice`] itself is `!Send`/`!Sync` (see [`crate::slice`]). Sharing one
/// instance across threads requires an external lock around the whole
/// `VirtualMemory`, never around individual slices.
pub struct VirtualMemory {
    chunks: Vec<Chunk>,
    allocated_total: u64,
    max_allocated_bytes: u32,
    diagnostic_sink: Rc<dyn DiagnosticSink>,
}

impl std::fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("chunks", &self.chunks.len())
            .field("allocated_total", &self.allocated_total)
            .field("max_allocated_bytes", &self.max_allocated_bytes)
            .finish()
    }
}

impl VirtualMemory {
    pub fn new(initial_capacity: u32) -> VirtualMemory {
        VirtualMemory::with_config(VirtualMemoryConfig {
            initial_capacity,
            ..Default::default()
        })
    }

    pub fn with_config(config: VirtualMemoryConfig) -> VirtualMemory {
        let mut vm = VirtualMemory {
            chunks: Vec::new(),
            allocated_total: 0,
            max_allocated_bytes: 0,
            diagnostic_sink: config.diagnostic_sink,
        };
        if config.initial_capacity > 0 {
            vm.add_chunk(config.initial_capacity);
        }
        vm
    }

    /// Sum of live reserved bytes across every chunk.
    ///
    /// Widened to `u64` rather than the source's `uint32_t`: the sum is
    /// across all chunks, and with enough chunks it can legitimately exceed
    /// a single `u32` even though each chunk's own capacity cannot.
    pub fn allocated_total(&self) -> u64 {
        self.allocated_total
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn report(&self, diagnostic: Diagnostic) {
        self.diagnostic_sink.report(diagnostic);
    }

    /// Rounds `requested` up to a power of two, bumps `max_allocated_bytes`
    /// if needed, and appends a chunk sized to the new high-water mark
    /// (not merely to `requested` — see the growth-policy note this
    /// preserves from the source implementation).
    fn add_chunk(&mut self, requested: u32) {
        let requested = next_power_of_two(requested);
        if requested > self.max_allocated_bytes {
            self.max_allocated_bytes = requested;
        }
        debug!(
            "adding chunk of {:#x} bytes (high-water mark {:#x})",
            self.max_allocated_bytes, self.max_allocated_bytes
        );
        self.chunks.push(Chunk::new(self.max_allocated_bytes));
    }

    fn find_chunk_owning(&mut self, slice: &Slice) -> Option<usize> {
        self.chunks.iter().position(|c| c.owns(slice))
    }

    fn reserve_scan(&mut self, size: u32) -> Option<Slice> {
        let idx = self.chunks.iter().position(|c| c.can_reserve(size))?;
        let slice = self.chunks[idx].reserve(size)?;
        self.allocated_total += size as u64;
        Some(slice)
    }

    /// Appends a new chunk sized for `size` and reserves from it; on
    /// failure (the promoted capacity still can't hold `size`, which can
    /// only happen once `size` exceeds `CHUNK_MAXIMUM_CAPACITY`), tears the
    /// new chunk back down, defragments every remaining chunk, and retries
    /// a plain scan.
    fn grow_and_alloc(&mut self, size: u32) -> Option<Slice> {
        self.add_chunk(size);
        if let Some(slice) = self.reserve_scan(size) {
            return Some(slice);
        }
        self.chunks.pop();
        for chunk in &mut self.chunks {
            chunk.defragment();
        }
        self.reserve_scan(size)
    }

    fn defragment_or_grow(&mut self, size: u32) -> Option<Slice> {
        let fragmented = self
            .chunks
            .iter()
            .position(|c| c.is_fragmented(size) && c.worth_defragmentation());

        let Some(idx) = fragmented else {
            return self.grow_and_alloc(size);
        };

        self.chunks[idx].defragment();
        if let Some(slice) = self.chunks[idx].reserve(size) {
            self.allocated_total += size as u64;
            return Some(slice);
        }
        self.reserve_scan(size)
    }

    /// Reserves `size` bytes somewhere, growing or defragmenting as
    /// needed. Returns `None` for `size == 0`, `size == u32::MAX`, or when
    /// no amount of growth/defragmentation can satisfy the request.
    pub fn alloc(&mut self, size: u32) -> Option<Slice> {
        if size == 0 || size == u32::MAX {
            return None;
        }
        if let Some(slice) = self.reserve_scan(size) {
            return Some(slice);
        }
        self.defragment_or_grow(size)
    }

    /// Resizes `slice` to `new_size`, moving it to a new chunk and copying
    /// its bytes if an in-place resize is not possible. `slice == None`
    /// behaves as `alloc(new_size)`.
    pub fn realloc(&mut self, slice: Option<Slice>, new_size: u32) -> Option<Slice> {
        let Some(slice) = slice else {
            return self.alloc(new_size);
        };

        let Some(idx) = self.find_chunk_owning(&slice) else {
            self.report(Diagnostic::UnknownChunk {
                addr: slice.address(),
            });
            return Some(slice);
        };

        let old_size = slice.size();
        match self.chunks[idx].resize(&slice, new_size) {
            ResizeStatus::Ok => {
                self.allocated_total = self.allocated_total + new_size as u64 - old_size as u64;
                Some(slice)
            }
            ResizeStatus::NoMemory => self.move_to_fresh_chunk(&slice, old_size, new_size),
            ResizeStatus::FragmentedMemory => {
                self.move_via_defragment_or_grow(&slice, old_size, new_size)
            }
            ResizeStatus::NullMemory => self.alloc(new_size),
            ResizeStatus::ZeroCapacity => {
                self.report(Diagnostic::ZeroCapacity {
                    addr: slice.address(),
                    requested: new_size,
                });
                Some(slice)
            }
            ResizeStatus::ZeroSize | ResizeStatus::UnknownAddress => Some(slice),
        }
    }

    fn move_to_fresh_chunk(&mut self, slice: &Slice, old_size: u32, new_size: u32) -> Option<Slice> {
        let fresh = self.grow_and_alloc(new_size)?;
        self.relocate(slice, &fresh, old_size);
        Some(fresh)
    }

    fn move_via_defragment_or_grow(
        &mut self,
        slice: &Slice,
        old_size: u32,
        new_size: u32,
    ) -> Option<Slice> {
        let fresh = self.defragment_or_grow(new_size)?;
        self.relocate(slice, &fresh, old_size);
        Some(fresh)
    }

    fn relocate(&mut self, old: &Slice, fresh: &Slice, old_size: u32) {
        let copy_len = old_size.min(fresh.size()) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(
                old.address() as *const u8,
                fresh.address() as *mut u8,
                copy_len,
            );
        }
        self.free(Some(old.clone()));
    }

    /// Releases `slice`. `slice == None` is a silent no-op.
    pub fn free(&mut self, slice: Option<Slice>) {
        let Some(slice) = slice else {
            return;
        };
        let Some(idx) = self.find_chunk_owning(&slice) else {
            self.report(Diagnostic::UnknownChunk {
                addr: slice.address(),
            });
            return;
        };
        let size = slice.size();
        match self.chunks[idx].release(&slice) {
            crate::error::ReleaseStatus::Ok => {
                self.allocated_total -= size as u64;
            }
            _ => {
                self.report(Diagnostic::UnknownFault {
                    addr: slice.address(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_power_of_two_rounds_up_and_respects_minimum() {
        assert_eq!(next_power_of_two(0), CHUNK_MINIMUM_CAPACITY);
        assert_eq!(next_power_of_two(1), CHUNK_MINIMUM_CAPACITY);
        assert_eq!(next_power_of_two(CHUNK_MINIMUM_CAPACITY + 1), CHUNK_MINIMUM_CAPACITY * 2);
        assert_eq!(next_power_of_two(CHUNK_MAXIMUM_CAPACITY), CHUNK_MAXIMUM_CAPACITY);
    }

    #[test]
    fn alloc_rejects_zero_and_max() {
        let mut vm = VirtualMemory::new(CHUNK_MINIMUM_CAPACITY);
        assert!(vm.alloc(0).is_none());
        assert!(vm.alloc(u32::MAX).is_none());
    }

    #[test]
    fn alloc_from_empty_vm_grows_a_chunk() {
        let mut vm = VirtualMemory::new(0);
        let a = vm.alloc(64).unwrap();
        assert_eq!(vm.allocated_total(), 64);
        let b = vm.alloc(64).unwrap();
        assert_eq!(vm.allocated_total(), 128);
        vm.free(Some(a));
        assert_eq!(vm.allocated_total(), 64);
        vm.free(Some(b));
        assert_eq!(vm.allocated_total(), 0);
    }

    #[test]
    fn realloc_of_none_behaves_as_alloc() {
        let mut vm = VirtualMemory::new(0);
        let slice = vm.realloc(None, 64).unwrap();
        assert_eq!(slice.size(), 64);
    }

    #[test]
    fn realloc_of_foreign_slice_reports_unknown_chunk_and_returns_it_unchanged() {
        use crate::error::RecordingDiagnosticSink;
        let sink = Rc::new(RecordingDiagnosticSink::new());
        let mut vm = VirtualMemory::with_config(VirtualMemoryConfig {
            initial_capacity: CHUNK_MINIMUM_CAPACITY,
            diagnostic_sink: sink.clone(),
        });
        let foreign = Slice::foreign(0x204, 32);
        let result = vm.realloc(Some(foreign.clone()), 32).unwrap();
        assert_eq!(result.address(), foreign.address());
        assert_eq!(
            sink.reported(),
            vec![Diagnostic::UnknownChunk { addr: 0x204 }]
        );

        vm.free(Some(foreign));
        assert_eq!(sink.reported().len(), 2);
    }

    #[test]
    fn defragmentation_unlocks_an_allocation_that_fits_only_after_compaction() {
        // Four 16-byte reservations exactly fill one CHUNK_MINIMUM_CAPACITY
        // chunk, so there is no leftover trailing free region to confuse
        // the scenario: freeing the 1st and 3rd leaves two 16-byte holes
        // that can't satisfy a 32-byte request until compacted.
        let mut vm = VirtualMemory::new(CHUNK_MINIMUM_CAPACITY);
        let a = vm.alloc(16).unwrap();
        let b = vm.alloc(16).unwrap();
        let c = vm.alloc(16).unwrap();
        let _d = vm.alloc(16).unwrap();
        vm.free(Some(a));
        vm.free(Some(c));

        let b_addr_before = b.address();
        let e = vm.alloc(32).unwrap();
        assert_eq!(e.size(), 32);
        assert_ne!(b.address(), b_addr_before);
    }

    #[test]
    fn random_fill_then_interleaved_free_then_triple_size_realloc() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut vm = VirtualMemory::new(0);
        let mut slices = Vec::with_capacity(255);
        for _ in 0..255 {
            let size = rng.gen_range(1..=8192);
            slices.push(vm.alloc(size).expect("allocation should succeed"));
        }

        for (i, slice) in slices.iter().enumerate() {
            if i % 2 == 0 {
                vm.free(Some(slice.clone()));
            }
        }

        for (i, slice) in slices.into_iter().enumerate() {
            if i % 2 == 1 {
                let old_size = slice.size();
                let resized = vm.realloc(Some(slice), old_size * 3).unwrap();
                assert_eq!(resized.size(), old_size * 3);
            }
        }
    }
}
