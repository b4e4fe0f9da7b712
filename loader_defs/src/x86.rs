// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86 architectural definitions needed to describe the guest's initial
//! long-mode register state.

#![allow(missing_docs)]

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const X64_CR0_PE: u64 = 0x0000000000000001;
pub const X64_CR0_PG: u64 = 0x0000000080000000;

pub const X64_CR4_PAE: u64 = 0x0000000000000020;

pub const X64_EFER_SCE: u64 = 0x0000000000000001;
pub const X64_EFER_LME: u64 = 0x0000000000000100;
pub const X64_EFER_LMA: u64 = 0x0000000000000400;
pub const X64_EFER_NXE: u64 = 0x0000000000000800;
pub const X64_EFER_SVME: u64 = 0x0000000000001000;

pub const X86X_MSR_DEFAULT_PAT: u64 = 0x0007040600070406;

/// Attributes for a flat 64-bit code segment: present, code, execute/read,
/// accessed, long mode, granularity.
pub const X64_DEFAULT_CODE_SEGMENT_ATTRIBUTES: u16 = 0xa09b;

/// Attributes for a flat data segment: present, data, read/write, accessed,
/// big, granularity.
pub const X64_DEFAULT_DATA_SEGMENT_ATTRIBUTES: u16 = 0xc093;

/// A GDT entry in the format loaded into guest memory.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GdtEntry {
    pub limit_low: u16,
    pub base_low: u16,
    pub base_middle: u8,
    pub attr_low: u8,
    pub attr_high: u8,
    pub base_high: u8,
}

static_assertions::const_assert_eq!(size_of::<GdtEntry>(), 8);
