// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The image-build trait implemented by the guest memory/state substrate, and
//! the scoped write view used to populate guest structures in place.

use crate::range::MemoryRange;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// BSP registers that loaders may set via [`ImageBuild::import_vp_register`].
///
/// Control registers, segments, and descriptor tables are owned by the
/// substrate's privileged setup calls and are not settable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X86Register {
    Rip(u64),
    Rsi(u64),
    Rsp(u64),
}

/// A write was issued to memory no allocation stage has claimed yet. This
/// indicates a stage ordering bug in the caller and is always fatal.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("write to {gpa:#x}..{end:#x} targets memory outside any prior allocation")]
pub struct AllocationOrderViolation {
    pub gpa: u64,
    pub end: u64,
}

/// Interface to the substrate that owns guest memory, the bump allocator, and
/// the BSP register state.
///
/// Allocation is a single monotonically increasing cursor over guest-physical
/// address space; addresses are never reused within a run.
pub trait ImageBuild {
    /// Move the allocation cursor to `gpa`.
    fn seek(&mut self, gpa: u64);

    /// Allocate `len` bytes at the current cursor, aligned up to `alignment`,
    /// returning the base of the new region. Fails if the region would overlap
    /// an existing allocation.
    ///
    /// `debug_tag` is a human readable string used to identify this region
    /// for debugging and reporting.
    fn allocate(&mut self, len: u64, alignment: u64, debug_tag: &str) -> anyhow::Result<u64>;

    /// Write `data` into previously allocated guest memory at `gpa`, which
    /// may sit at any byte offset within an allocated range.
    fn write(&mut self, gpa: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Build the guest's initial identity-mapped page tables with the given
    /// number of levels, returning the exact allocator range consumed.
    fn setup_paging(&mut self, levels: u8) -> anyhow::Result<MemoryRange>;

    /// Build the guest's initial GDT and segment state, returning the exact
    /// allocator range consumed.
    fn setup_gdt(&mut self) -> anyhow::Result<MemoryRange>;

    /// Build the guest's initial (empty) IDT, returning the exact allocator
    /// range consumed.
    fn setup_idt(&mut self) -> anyhow::Result<MemoryRange>;

    /// Import a register into the BSP.
    fn import_vp_register(&mut self, register: X86Register) -> anyhow::Result<()>;
}

/// A scoped, exclusive write view over a guest structure at a fixed GPA.
///
/// The view holds the only mutable borrow of the substrate while it is alive,
/// so no allocation can occur until the populated value is committed; the
/// borrow checker enforces the release-before-allocate contract.
pub struct GuestStructView<'a, T: IntoBytes + Immutable> {
    importer: &'a mut dyn ImageBuild,
    gpa: u64,
    value: T,
}

impl<'a, T: IntoBytes + Immutable + FromZeros> GuestStructView<'a, T> {
    /// Create a zero-initialized view of a `T` located at `gpa`.
    pub fn new(importer: &'a mut dyn ImageBuild, gpa: u64) -> Self {
        Self {
            importer,
            gpa,
            value: T::new_zeroed(),
        }
    }
}

impl<T: IntoBytes + Immutable> GuestStructView<'_, T> {
    /// Write the populated value into guest memory, releasing the view.
    pub fn commit(self) -> anyhow::Result<()> {
        self.importer.write(self.gpa, self.value.as_bytes())
    }

    /// The GPA this view writes to.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }
}

impl<T: IntoBytes + Immutable> core::ops::Deref for GuestStructView<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: IntoBytes + Immutable> core::ops::DerefMut for GuestStructView<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
