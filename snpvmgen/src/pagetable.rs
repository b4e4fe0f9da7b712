// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Identity-mapped x64 page table construction for the guest's initial
//! long-mode entry.

use loader_defs::PAGE_SIZE;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const X64_PTE_PRESENT: u64 = 1;
const X64_PTE_READ_WRITE: u64 = 1 << 1;
const X64_PTE_ACCESSED: u64 = 1 << 5;
const X64_PTE_DIRTY: u64 = 1 << 6;
const X64_PTE_LARGE_PAGE: u64 = 1 << 7;

const PAGE_TABLE_ENTRY_COUNT: usize = 512;

/// Number of bytes in a 2MB page for X64.
pub const X64_LARGE_PAGE_SIZE: u64 = 0x200000;

/// Number of bytes in a 1GB page for X64.
pub const X64_1GB_PAGE_SIZE: u64 = 0x40000000;

/// Size of the identity map built by [`build_identity_map_4gb`], in bytes.
pub const IDENTITY_MAP_SIZE: u64 = 4 * X64_1GB_PAGE_SIZE;

/// Number of 4K pages [`build_identity_map_4gb`] emits: one PML4, one PDPT,
/// and one PDE table per mapped GB.
pub const IDENTITY_MAP_PAGE_COUNT: u64 = 2 + IDENTITY_MAP_SIZE / X64_1GB_PAGE_SIZE;

#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

#[derive(Debug, Copy, Clone)]
pub enum PageTableEntryType {
    Leaf2MbPage(u64),
    Pde(u64),
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("entry", &self.entry)
            .field("is_present", &self.is_present())
            .field("is_large_page", &self.is_large_page())
            .finish()
    }
}

impl PageTableEntry {
    /// Set an AMD64 PDE to either represent a leaf 2MB page or PDE.
    /// This sets the PTE to present, accessed, dirty, read write execute.
    pub fn set_entry(&mut self, entry_type: PageTableEntryType) {
        self.entry = X64_PTE_PRESENT | X64_PTE_ACCESSED | X64_PTE_READ_WRITE;

        match entry_type {
            PageTableEntryType::Leaf2MbPage(address) => {
                // Leaf entry, set like UEFI does for 2MB pages. Must be 2MB aligned.
                assert!(address % X64_LARGE_PAGE_SIZE == 0);
                self.entry |= address;
                self.entry |= X64_PTE_LARGE_PAGE | X64_PTE_DIRTY;
            }
            PageTableEntryType::Pde(address) => {
                // Points to another pagetable.
                assert!(address % PAGE_SIZE == 0);
                self.entry |= address;
            }
        }
    }

    pub fn is_present(&self) -> bool {
        self.entry & X64_PTE_PRESENT == X64_PTE_PRESENT
    }

    pub fn is_large_page(&self) -> bool {
        self.entry & X64_PTE_LARGE_PAGE == X64_PTE_LARGE_PAGE
    }

    #[cfg(test)]
    pub fn raw(&self) -> u64 {
        self.entry
    }
}

#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRY_COUNT],
}

impl std::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl std::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Build a set of page tables identity mapping the bottom 4GB of the address
/// space with 2MB leaves, with the PML4 placed at `page_table_gpa`.
///
/// Layout in the returned buffer: PML4, PDPT, then one PDE table per GB.
pub fn build_identity_map_4gb(page_table_gpa: u64) -> Vec<u8> {
    assert!(page_table_gpa % PAGE_SIZE == 0);

    let pde_count = (IDENTITY_MAP_SIZE / X64_1GB_PAGE_SIZE) as usize;
    let mut tables: Vec<PageTable> = vec![FromZeros::new_zeroed(); 2 + pde_count];
    let pdpt_gpa = page_table_gpa + PAGE_SIZE;

    tables[0][0].set_entry(PageTableEntryType::Pde(pdpt_gpa));

    for pde_index in 0..pde_count {
        let pde_table_gpa = pdpt_gpa + PAGE_SIZE * (1 + pde_index as u64);
        tables[1][pde_index].set_entry(PageTableEntryType::Pde(pde_table_gpa));

        let table = &mut tables[2 + pde_index];
        let base = pde_index as u64 * X64_1GB_PAGE_SIZE;
        for (i, entry) in table.entries.iter_mut().enumerate() {
            entry.set_entry(PageTableEntryType::Leaf2MbPage(
                base + i as u64 * X64_LARGE_PAGE_SIZE,
            ));
        }
    }

    let mut flat_tables = Vec::with_capacity(tables.len() * PAGE_SIZE as usize);
    for table in &tables {
        flat_tables.extend_from_slice(table.as_bytes());
    }
    flat_tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_map_structure() {
        let gpa = 0x2005000;
        let flat = build_identity_map_4gb(gpa);
        assert_eq!(flat.len() as u64, IDENTITY_MAP_PAGE_COUNT * PAGE_SIZE);

        let pml4 = PageTable::read_from_bytes(&flat[..PAGE_SIZE as usize]).unwrap();
        assert!(pml4[0].is_present());
        assert!(!pml4[0].is_large_page());
        assert_eq!(pml4[0].raw() & 0x000f_ffff_ffff_f000, gpa + PAGE_SIZE);
        assert!(!pml4[1].is_present());

        let pdpt =
            PageTable::read_from_bytes(&flat[PAGE_SIZE as usize..2 * PAGE_SIZE as usize]).unwrap();
        for i in 0..4 {
            assert!(pdpt[i].is_present());
            assert_eq!(
                pdpt[i].raw() & 0x000f_ffff_ffff_f000,
                gpa + PAGE_SIZE * (2 + i as u64)
            );
        }
        assert!(!pdpt[4].is_present());

        // Spot check a 2MB leaf: entry 3 of the second PDE table maps
        // 1GB + 3 * 2MB.
        let pde1 = PageTable::read_from_bytes(
            &flat[3 * PAGE_SIZE as usize..4 * PAGE_SIZE as usize],
        )
        .unwrap();
        assert!(pde1[3].is_large_page());
        assert_eq!(
            pde1[3].raw() & 0x000f_ffff_ffff_f000,
            X64_1GB_PAGE_SIZE + 3 * X64_LARGE_PAGE_SIZE
        );
    }
}
