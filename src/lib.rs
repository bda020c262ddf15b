/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! A user-space virtual-memory allocator that carves fixed-address slices
//! out of host-allocated chunks.
//!
//! [`VirtualMemory`] owns a growable list of [`chunk::Chunk`]s. Each chunk
//! wraps one buffer obtained from the host allocator and a [`region::RegionTable`]
//! tracking which byte ranges within it are free and which are reserved.
//! `alloc`/`realloc`/`free` hand out [`slice::Slice`] handles whose address
//! the allocator is free to move during defragmentation — every clone of a
//! handle observes the move.
//!
//! ```
//! use regionvm::VirtualMemory;
//!
//! let mut vm = VirtualMemory::new(0);
//! let a = vm.alloc(64).unwrap();
//! assert_eq!(vm.allocated_total(), 64);
//! vm.free(Some(a));
//! assert_eq!(vm.allocated_total(), 0);
//! ```
//!
//! # Concurrency
//!
//! A `VirtualMemory` instance is not internally synchronized: every method
//! requires exclusive access, and [`slice::Slice`] is deliberately
//! `!Send`/`!Sync`. Callers that need to share one instance across threads
//! must put a lock around the whole instance.

pub mod chunk;
pub mod error;
pub mod region;
pub mod slice;
pub mod virtual_memory;

pub use error::{Diagnostic, DiagnosticSink, LoggingDiagnosticSink, RecordingDiagnosticSink};
pub use slice::{RawSlice, Slice};
pub use virtual_memory::{next_power_of_two, VirtualMemory, VirtualMemoryConfig};

/// Smallest capacity a chunk is ever created with.
pub const CHUNK_MINIMUM_CAPACITY: u32 = 64;

/// Largest capacity a chunk can hold: `2^32 - 1`. Note that `alloc`/`realloc`
/// still reject a *request* of exactly `u32::MAX` as a sentinel value (see
/// [`virtual_memory::VirtualMemory::alloc`]) even though it equals this constant.
pub const CHUNK_MAXIMUM_CAPACITY: u32 = u32::MAX;
