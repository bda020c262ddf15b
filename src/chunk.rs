/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! A single host-backed buffer plus the region table that carves it up.

use log::debug;
use std::alloc::{self, Layout};

use crate::error::{ReleaseStatus, ResizeStatus};
use crate::region::{Region, RegionTable};
use crate::slice::{RawSlice, Slice};

/// One contiguous, power-of-two-sized buffer obtained from the host
/// allocator, plus the free/reserved bookkeeping for addresses within it.
///
/// A chunk never grows or shrinks its own buffer; growth happens by
/// adding whole new chunks at the [`crate::VirtualMemory`] layer.
pub struct Chunk {
    buffer: *mut u8,
    layout: Layout,
    base: usize,
    capacity: u32,
    table: RegionTable,
    slices: Vec<Slice>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("free", &self.table.free_regions())
            .field("reserved", &self.table.reserved_regions())
            .finish()
    }
}

impl Chunk {
    /// Allocates a fresh buffer of `capacity` bytes from the host and
    /// returns a chunk with a single free region spanning the whole thing.
    ///
    /// `capacity` is expected to be a power of two in
    /// `[CHUNK_MINIMUM_CAPACITY, CHUNK_MAXIMUM_CAPACITY]` in normal use;
    /// that sizing is enforced by `VirtualMemory::add_chunk`, which is the
    /// only production caller. This constructor itself places no such
    /// restriction, so unit tests can exercise the region bookkeeping at
    /// whatever capacity makes a scenario easiest to read.
    pub fn new(capacity: u32) -> Chunk {
        let layout = Layout::from_size_align(capacity as usize, 16)
            .expect("chunk capacity does not fit a valid layout");
        let buffer = unsafe { alloc::alloc(layout) };
        if buffer.is_null() {
            alloc::handle_alloc_error(layout);
        }
        let base = buffer as usize;

        let mut table = RegionTable::new();
        table.free_add(Region::new(base, capacity));

        debug!("new chunk: base={:#x} capacity={:#x}", base, capacity);

        Chunk {
            buffer,
            layout,
            base,
            capacity,
            table,
            slices: Vec::new(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn free_total(&self) -> u64 {
        self.table.free_total()
    }

    pub fn reserved_total(&self) -> u64 {
        self.table
            .reserved_regions()
            .iter()
            .map(|r| r.size as u64)
            .sum()
    }

    /// True iff `addr` falls within this chunk's backing buffer.
    fn contains_addr(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.capacity as usize
    }

    /// True iff `slice` is both within this chunk's address range and
    /// present in the reserved set.
    pub fn owns(&self, slice: &Slice) -> bool {
        self.contains_addr(slice.address()) && self.table.reserved_find(slice.address()).is_some()
    }

    pub fn can_reserve(&self, size: u32) -> bool {
        size > 0 && self.table.free_find(|r| r.size >= size).is_some()
    }

    /// First-fit reservation. Returns `None` if no free region is large
    /// enough; rejects `size == 0` and `size == u32::MAX`.
    pub fn reserve(&mut self, size: u32) -> Option<Slice> {
        if size == 0 || size == u32::MAX {
            return None;
        }
        let candidate = self.table.free_find(|r| r.size >= size)?;
        let remainder = Region::new(candidate.addr + size as usize, candidate.size - size);
        self.table.free_replace(candidate, remainder);

        let reserved = Region::new(candidate.addr, size);
        self.table.reserved_add(reserved);

        let slice = Slice::new(candidate.addr, size);
        self.slices.push(slice.clone());
        Some(slice)
    }

    /// Releases a previously-reserved slice back to the free set.
    pub fn release(&mut self, slice: &Slice) -> ReleaseStatus {
        let raw = slice.raw();
        let Some(reserved) = self.table.reserved_find(raw.addr) else {
            return ReleaseStatus::UnknownAddress;
        };
        self.table.reserved_remove(reserved);
        self.table.free_add(Region::new(reserved.addr, reserved.size));
        self.table.free_union();
        self.slices.retain(|s| !s.same_reservation(slice));
        ReleaseStatus::Ok
    }

    /// Attempts to resize a reserved slice in place. See the module-level
    /// contract for the exact status dispatch.
    pub fn resize(&mut self, slice: &Slice, new_size: u32) -> ResizeStatus {
        if new_size == 0 {
            return ResizeStatus::ZeroSize;
        }
        if new_size > self.capacity {
            return ResizeStatus::ZeroCapacity;
        }
        let raw = slice.raw();
        let Some(reserved) = self.table.reserved_find(raw.addr) else {
            return ResizeStatus::UnknownAddress;
        };

        if new_size == reserved.size {
            return ResizeStatus::Ok;
        }

        if new_size < reserved.size {
            let released_addr = reserved.addr + new_size as usize;
            let released_size = reserved.size - new_size;
            self.table
                .reserved_replace(reserved, Region::new(reserved.addr, new_size));
            self.table.free_add(Region::new(released_addr, released_size));
            self.table.free_union();
            slice.set_size(new_size);
            return ResizeStatus::Ok;
        }

        let needed = new_size - reserved.size;
        let grow_addr = reserved.end();
        if let Some(adjacent) = self
            .table
            .free_find(|r| r.addr == grow_addr && r.size >= needed)
        {
            let remainder = Region::new(adjacent.addr + needed as usize, adjacent.size - needed);
            self.table.free_replace(adjacent, remainder);
            self.table
                .reserved_replace(reserved, Region::new(reserved.addr, new_size));
            slice.set_size(new_size);
            return ResizeStatus::Ok;
        }

        if self.table.free_total() >= needed as u64 {
            ResizeStatus::FragmentedMemory
        } else {
            ResizeStatus::NoMemory
        }
    }

    /// True iff `size` cannot currently be reserved but could be after
    /// defragmentation (enough total free bytes exist, just not contiguous).
    pub fn is_fragmented(&self, size: u32) -> bool {
        !self.can_reserve(size) && self.table.free_total() >= size as u64
    }

    /// A pure heuristic over the free-region shape: worth compacting when
    /// there is more than one free region and the largest one alone would
    /// not account for all free bytes (i.e. the free space really is
    /// scattered, not just one region sitting below a size threshold).
    pub fn worth_defragmentation(&self) -> bool {
        if self.table.free_count() < 2 {
            return false;
        }
        let largest = self.table.free_largest().map(|r| r.size as u64).unwrap_or(0);
        largest < self.table.free_total()
    }

    /// Compacts every reserved region to the low end of the chunk in
    /// ascending address order, updating each live slice's address in
    /// place, then collapses the free set to (at most) one trailing region.
    pub fn defragment(&mut self) {
        self.table.reserved_sort();
        let regions: Vec<Region> = self.table.reserved_regions().to_vec();

        let mut offset = self.base;
        let mut moved = Vec::with_capacity(regions.len());
        for region in &regions {
            if region.addr != offset {
                unsafe {
                    std::ptr::copy(
                        region.addr as *const u8,
                        offset as *mut u8,
                        region.size as usize,
                    );
                }
                if let Some(slice) = self.slices.iter().find(|s| s.raw() == RawSlice {
                    addr: region.addr,
                    size: region.size,
                }) {
                    slice.set_address(offset);
                }
            }
            moved.push(Region::new(offset, region.size));
            offset += region.size as usize;
        }

        self.table.reserved_clear();
        for region in moved {
            self.table.reserved_add(region);
        }

        self.table.free_clear();
        let remainder = self.base + self.capacity as usize - offset;
        if remainder > 0 {
            self.table.free_add(Region::new(offset, remainder as u32));
        }

        debug!(
            "defragmented chunk base={:#x}: {} reserved region(s), {} free byte(s) trailing",
            self.base,
            self.table.reserved_regions().len(),
            remainder
        );
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.buffer, self.layout);
        }
    }
}
