/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Status codes returned from chunk-internal calls, and the small set of
//! diagnostics that actually cross the library boundary.
//!
//! These are two different things on purpose. [`ResizeStatus`] and
//! [`ReleaseStatus`] are *expected* outcomes a caller dispatches on — `Ok`
//! is the common case, not an absence of error — so they are plain enums,
//! not something propagated with `?`. [`Diagnostic`] is the handful of
//! conditions callers cannot route around: an unowned slice, a corrupt
//! resize target, an unexplained release failure. Those go to a
//! [`DiagnosticSink`] instead of being returned, mirroring how this
//! allocator's embedder keeps its own error log separate from the runtime.

use log::{error, warn};
use std::fmt;
use thiserror::Error;

/// Outcome of [`crate::chunk::Chunk::resize`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    #[error("resize succeeded in place")]
    Ok,
    #[error("slice is null")]
    NullMemory,
    #[error("slice is not reserved in this chunk")]
    UnknownAddress,
    #[error("requested size is zero")]
    ZeroSize,
    #[error("requested size exceeds chunk capacity")]
    ZeroCapacity,
    #[error("chunk is fragmented; defragmentation may unlock this resize")]
    FragmentedMemory,
    #[error("not enough free memory in this chunk")]
    NoMemory,
}

/// Outcome of [`crate::chunk::Chunk::release`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    #[error("release succeeded")]
    Ok,
    #[error("slice is null")]
    NullMemory,
    #[error("slice is not reserved in this chunk")]
    UnknownAddress,
}

/// Conditions reported to a [`DiagnosticSink`] rather than returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("slice at {addr:#x} is not owned by any chunk in this virtual memory")]
    UnknownChunk { addr: usize },
    #[error("resize of slice at {addr:#x} to {requested} bytes exceeds chunk capacity")]
    ZeroCapacity { addr: usize, requested: u32 },
    #[error("release of slice at {addr:#x} failed with an unexpected status")]
    UnknownFault { addr: usize },
}

/// Where a [`VirtualMemory`](crate::VirtualMemory) sends [`Diagnostic`]s.
///
/// The default sink logs through the `log` facade; embedders that keep
/// their own error log can plug in an implementation that forwards there
/// instead, and tests use [`RecordingDiagnosticSink`] to assert on what
/// was reported without scraping log output.
pub trait DiagnosticSink: fmt::Debug {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards every diagnostic to the `log` crate. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDiagnosticSink;

impl DiagnosticSink for LoggingDiagnosticSink {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::UnknownChunk { .. } => warn!("{diagnostic}"),
            Diagnostic::ZeroCapacity { .. } => error!("{diagnostic}"),
            Diagnostic::UnknownFault { .. } => error!("{diagnostic}"),
        }
    }
}

/// Collects every reported diagnostic into a `Vec`, in order. Used by this
/// crate's own tests; also handy for embedders writing their own tests
/// against code that uses a [`VirtualMemory`](crate::VirtualMemory).
#[derive(Debug, Default)]
pub struct RecordingDiagnosticSink {
    reported: std::cell::RefCell<Vec<Diagnostic>>,
}

impl RecordingDiagnosticSink {
    pub fn new() -> RecordingDiagnosticSink {
        RecordingDiagnosticSink::default()
    }

    pub fn reported(&self) -> Vec<Diagnostic> {
        self.reported.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.reported.borrow().is_empty()
    }
}

impl DiagnosticSink for RecordingDiagnosticSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.reported.borrow_mut().push(diagnostic);
    }
}
