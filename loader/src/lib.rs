// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core logic for assembling the initial guest-physical memory image and BSP
//! entry state of an SEV-SNP guest: boot header validation, guest address map
//! orchestration, and e820 memory map assembly.

#![forbid(unsafe_code)]

pub mod e820;
pub mod header;
pub mod importer;
pub mod linux;
pub mod range;

use loader_defs::PAGE_SIZE;

/// Align an address up to the start of the next page.
pub fn align_up_to_page_size(address: u64) -> u64 {
    (address + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
