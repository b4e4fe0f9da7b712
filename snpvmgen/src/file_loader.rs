// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implements the image-build substrate that serializes loaded guest state
//! into the IGVM binary format for an SEV-SNP guest.

use crate::pagetable::build_identity_map_4gb;
use crate::pagetable::IDENTITY_MAP_PAGE_COUNT;
use anyhow::Context;
use igvm::snp_defs::SevSelector;
use igvm::snp_defs::SevVmsa;
use igvm::IgvmDirectiveHeader;
use igvm::IgvmFile;
use igvm::IgvmInitializationHeader;
use igvm::IgvmPlatformHeader;
use igvm::IgvmRevision;
use igvm_defs::IgvmPageDataFlags;
use igvm_defs::IgvmPageDataType;
use igvm_defs::IgvmPlatformType;
use igvm_defs::SnpPolicy;
use igvm_defs::IGVM_VHS_SUPPORTED_PLATFORM;
use igvm_defs::PAGE_SIZE_4K;
use loader::importer::AllocationOrderViolation;
use loader::importer::ImageBuild;
use loader::importer::X86Register;
use loader::linux::SNP_CPUID_PAGE_BASE;
use loader::range::MemoryRange;
use loader_defs::x86::GdtEntry;
use loader_defs::x86::X64_CR0_PE;
use loader_defs::x86::X64_CR0_PG;
use loader_defs::x86::X64_CR4_PAE;
use loader_defs::x86::X64_DEFAULT_CODE_SEGMENT_ATTRIBUTES;
use loader_defs::x86::X64_DEFAULT_DATA_SEGMENT_ATTRIBUTES;
use loader_defs::x86::X64_EFER_LMA;
use loader_defs::x86::X64_EFER_LME;
use loader_defs::x86::X64_EFER_NXE;
use loader_defs::x86::X64_EFER_SCE;
use loader_defs::x86::X64_EFER_SVME;
use loader_defs::x86::X86X_MSR_DEFAULT_PAT;
use range_map_vec::Entry;
use range_map_vec::RangeMap;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;
// The igvm crate's VMSA types implement the zerocopy 0.7 traits.
use zerocopy_07::FromZeroes;

pub const DEFAULT_COMPATIBILITY_MASK: u32 = 0x1;

/// Guest policy for the generated file: SMT allowed, reserved-must-be-one,
/// minimum ABI version 0.31.
pub const DEFAULT_SNP_POLICY: u64 = (1 << 17) | (1 << 16) | 0x1f;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RangeInfo {
    tag: String,
}

/// An image builder that accumulates loaded pages and BSP state, then
/// serializes them as IGVM directives.
pub struct IgvmImageLoader {
    cursor: u64,
    accepted_ranges: RangeMap<u64, RangeInfo>,
    /// Staged contents of normal pages, written at byte granularity and
    /// emitted as one directive per page at finalize.
    page_contents: BTreeMap<u64, Vec<u8>>,
    /// Pages covered by a directive outside `page_contents` (the CPUID and
    /// secrets window, the VMSA).
    written_pages: BTreeSet<u64>,
    platform_header: IgvmPlatformHeader,
    initialization_headers: Vec<IgvmInitializationHeader>,
    directives: Vec<IgvmDirectiveHeader>,
    page_data_directives: Vec<IgvmDirectiveHeader>,
    vmsa: Box<SevVmsa>,
}

impl IgvmImageLoader {
    pub fn new(policy: SnpPolicy) -> anyhow::Result<Self> {
        let info = IGVM_VHS_SUPPORTED_PLATFORM {
            compatibility_mask: DEFAULT_COMPATIBILITY_MASK,
            highest_vtl: 0,
            platform_type: IgvmPlatformType::SEV_SNP,
            platform_version: igvm_defs::IGVM_SEV_SNP_PLATFORM_VERSION,
            shared_gpa_boundary: 0,
        };

        let init_header = IgvmInitializationHeader::GuestPolicy {
            policy: policy.into(),
            compatibility_mask: DEFAULT_COMPATIBILITY_MASK,
        };

        // Fill in reset values that are needed for consistency.
        let mut vmsa: Box<SevVmsa> = FromZeroes::new_box_zeroed();
        vmsa.efer = X64_EFER_SVME;
        vmsa.sev_features.set_snp(true);
        // Maps to LegacyX87 bit.
        vmsa.xcr0 = 0x1;

        let mut loader = Self {
            cursor: 0,
            accepted_ranges: RangeMap::new(),
            page_contents: BTreeMap::new(),
            written_pages: BTreeSet::new(),
            platform_header: IgvmPlatformHeader::SupportedPlatform(info),
            initialization_headers: vec![init_header],
            directives: Vec::new(),
            page_data_directives: Vec::new(),
            vmsa,
        };

        // The reserved window below the firmware region: CPUID, extended
        // state CPUID, and secrets pages, plus one spare page. The platform
        // fills these at launch.
        let base_page = SNP_CPUID_PAGE_BASE / PAGE_SIZE_4K;
        loader.import_pages(base_page, 1, "cpuid", IgvmPageDataType::CPUID_DATA, &[])?;
        loader.import_pages(base_page + 1, 1, "cpuid-xf", IgvmPageDataType::CPUID_XF, &[])?;
        loader.import_pages(base_page + 2, 1, "secrets", IgvmPageDataType::SECRETS, &[])?;
        loader.accept_new_range(base_page + 3, 1, "snp-reserved")?;
        loader.written_pages.insert(base_page + 3);

        Ok(loader)
    }

    /// Accept a new page range into the map of accepted ranges, failing on
    /// overlap with anything previously accepted.
    fn accept_new_range(
        &mut self,
        page_base: u64,
        page_count: u64,
        tag: &str,
    ) -> anyhow::Result<()> {
        let page_end = page_base + page_count - 1;
        match self.accepted_ranges.entry(page_base..=page_end) {
            Entry::Overlapping(entry) => {
                let (overlap_start, overlap_end, ref overlap_info) = *entry.get();
                Err(anyhow::anyhow!(
                    "{} at {:#x}..{:#x} overlaps {} at {:#x}..{:#x}",
                    tag,
                    page_base * PAGE_SIZE_4K,
                    (page_end + 1) * PAGE_SIZE_4K,
                    overlap_info.tag,
                    overlap_start * PAGE_SIZE_4K,
                    (overlap_end + 1) * PAGE_SIZE_4K,
                ))
            }
            Entry::Vacant(entry) => {
                entry.insert(RangeInfo {
                    tag: tag.to_string(),
                });
                Ok(())
            }
        }
    }

    fn import_pages(
        &mut self,
        page_base: u64,
        page_count: u64,
        debug_tag: &str,
        data_type: IgvmPageDataType,
        mut data: &[u8],
    ) -> anyhow::Result<()> {
        tracing::debug!(
            page_base,
            page_count,
            data_size = data.len(),
            "Importing page",
        );

        // Pages must not overlap already accepted ranges.
        self.accept_new_range(page_base, page_count, debug_tag)?;
        self.import_data_pages(page_base, page_count, data_type, &mut data);
        Ok(())
    }

    /// Emit page data directives without acceptance bookkeeping, for pages
    /// inside a range accepted by a prior allocation.
    fn import_data_pages(
        &mut self,
        page_base: u64,
        page_count: u64,
        data_type: IgvmPageDataType,
        data: &mut &[u8],
    ) {
        for page in page_base..page_base + page_count {
            // Split data slice into data to be imported for this page and remaining.
            let import_data_len = std::cmp::min(PAGE_SIZE_4K as usize, data.len());
            let (import_data, data_remaining) = data.split_at(import_data_len);
            *data = data_remaining;

            self.written_pages.insert(page);
            self.page_data_directives
                .push(IgvmDirectiveHeader::PageData {
                    gpa: page * PAGE_SIZE_4K,
                    compatibility_mask: DEFAULT_COMPATIBILITY_MASK,
                    flags: IgvmPageDataFlags::new(),
                    data_type,
                    data: import_data.to_vec(),
                });
        }
    }

    fn import_vmsa_segment(&mut self, selector: u16, attributes: u16) -> SevSelector {
        SevSelector {
            limit: 0xffffffff,
            base: 0,
            selector,
            attrib: (attributes & 0xFF) | ((attributes >> 4) & 0xF00),
        }
    }

    /// Finalize the loader state, returning the serialized IGVM file
    /// contents.
    pub fn finalize(mut self) -> anyhow::Result<Vec<u8>> {
        // The VMSA occupies the next page of the address map.
        let vmsa_gpa = self.allocate(PAGE_SIZE_4K, PAGE_SIZE_4K, "vmsa")?;
        self.written_pages.insert(vmsa_gpa / PAGE_SIZE_4K);

        self.emit_layout();

        // Staged page contents become normal page directives.
        for (&page, contents) in &self.page_contents {
            self.page_data_directives
                .push(IgvmDirectiveHeader::PageData {
                    gpa: page * PAGE_SIZE_4K,
                    compatibility_mask: DEFAULT_COMPATIBILITY_MASK,
                    flags: IgvmPageDataFlags::new(),
                    data_type: IgvmPageDataType::NORMAL,
                    data: contents.clone(),
                });
        }

        // Every accepted page must carry a directive; emit zero pages for
        // allocated-but-unwritten ranges (stack, firmware window gaps).
        let unwritten: Vec<u64> = self
            .accepted_ranges
            .iter()
            .flat_map(|(range, _)| range.clone())
            .filter(|page| {
                !self.written_pages.contains(page) && !self.page_contents.contains_key(page)
            })
            .collect();
        for page in unwritten {
            self.page_data_directives
                .push(IgvmDirectiveHeader::PageData {
                    gpa: page * PAGE_SIZE_4K,
                    compatibility_mask: DEFAULT_COMPATIBILITY_MASK,
                    flags: IgvmPageDataFlags::new(),
                    data_type: IgvmPageDataType::NORMAL,
                    data: Vec::new(),
                });
        }

        // Keep the page data in GPA order so the emitted file is stable.
        self.page_data_directives
            .sort_by_key(|directive| match directive {
                IgvmDirectiveHeader::PageData { gpa, .. } => *gpa,
                _ => unreachable!("all directives should be IgvmDirectiveHeader::PageData"),
            });
        self.directives.append(&mut self.page_data_directives);

        self.directives.push(IgvmDirectiveHeader::SnpVpContext {
            gpa: vmsa_gpa,
            compatibility_mask: DEFAULT_COMPATIBILITY_MASK,
            vp_index: 0,
            vmsa: self.vmsa,
        });

        let igvm_file = IgvmFile::new(
            IgvmRevision::V1,
            vec![self.platform_header],
            self.initialization_headers,
            self.directives,
        )
        .context("unable to create igvm file")?;

        let mut binary = Vec::new();
        igvm_file
            .serialize(&mut binary)
            .context("unable to serialize igvm file")?;
        Ok(binary)
    }

    /// Emit a report of the built file's address map to tracing.
    fn emit_layout(&self) {
        tracing::info!("IGVM file layout:");
        for (range, info) in self.accepted_ranges.iter().rev() {
            tracing::info!(
                tag = info.tag,
                "{:#x} - {:#x}",
                range.start() * PAGE_SIZE_4K,
                (range.end() + 1) * PAGE_SIZE_4K,
            );
        }
    }

    fn contains_pages(&self, page_base: u64, page_count: u64) -> bool {
        (page_base..page_base + page_count).all(|page| self.accepted_ranges.get(&page).is_some())
    }
}

impl ImageBuild for IgvmImageLoader {
    fn seek(&mut self, gpa: u64) {
        self.cursor = gpa;
    }

    fn allocate(&mut self, len: u64, alignment: u64, debug_tag: &str) -> anyhow::Result<u64> {
        let base = self.cursor.next_multiple_of(alignment);
        let page_count = len.div_ceil(PAGE_SIZE_4K).max(1);
        self.accept_new_range(base / PAGE_SIZE_4K, page_count, debug_tag)?;
        tracing::debug!(
            debug_tag,
            base = format_args!("{base:#x}"),
            len = format_args!("{len:#x}"),
            "allocated region"
        );
        self.cursor = base + len;
        Ok(base)
    }

    fn write(&mut self, gpa: u64, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = gpa + data.len() as u64;
        let page_base = gpa / PAGE_SIZE_4K;
        let page_count = end.div_ceil(PAGE_SIZE_4K) - page_base;
        if !self.contains_pages(page_base, page_count) {
            return Err(AllocationOrderViolation { gpa, end }.into());
        }

        // Writes are byte granular. ACPI tables in particular land at
        // arbitrary offsets within their pages, so stage the bytes into
        // per-page buffers and emit whole pages at finalize.
        let mut offset = gpa;
        let mut remaining = data;
        while !remaining.is_empty() {
            let page = offset / PAGE_SIZE_4K;
            let in_page = (offset % PAGE_SIZE_4K) as usize;
            let take = remaining.len().min(PAGE_SIZE_4K as usize - in_page);
            let buf = self
                .page_contents
                .entry(page)
                .or_insert_with(|| vec![0; PAGE_SIZE_4K as usize]);
            buf[in_page..in_page + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            offset += take as u64;
        }
        Ok(())
    }

    fn setup_paging(&mut self, levels: u8) -> anyhow::Result<MemoryRange> {
        if levels != 4 {
            anyhow::bail!("only 4-level paging is supported, requested {levels}");
        }
        let size = IDENTITY_MAP_PAGE_COUNT * PAGE_SIZE_4K;
        let base = self.allocate(size, PAGE_SIZE_4K, "page-tables")?;
        let tables = build_identity_map_4gb(base);
        self.write(base, &tables)?;

        self.vmsa.cr3 = base;
        self.vmsa.cr0 = X64_CR0_PE | X64_CR0_PG;
        self.vmsa.cr4 = X64_CR4_PAE;
        // All SEV guests require EFER.SVME for the VMSA to be valid.
        self.vmsa.efer = X64_EFER_SVME | X64_EFER_SCE | X64_EFER_LME | X64_EFER_LMA | X64_EFER_NXE;
        self.vmsa.pat = X86X_MSR_DEFAULT_PAT;

        Ok(MemoryRange::new(base..base + size))
    }

    fn setup_gdt(&mut self) -> anyhow::Result<MemoryRange> {
        // A default GDT with cs as entry 1 and the data segments (ds, es, fs,
        // gs, ss) as entry 2.
        let default_code_attributes = X64_DEFAULT_CODE_SEGMENT_ATTRIBUTES;
        let default_data_attributes = X64_DEFAULT_DATA_SEGMENT_ATTRIBUTES;
        let gdt: [GdtEntry; 4] = [
            GdtEntry::new_zeroed(),
            GdtEntry {
                limit_low: 0xffff,
                attr_low: default_code_attributes as u8,
                attr_high: (default_code_attributes >> 8) as u8,
                ..GdtEntry::new_zeroed()
            },
            GdtEntry {
                limit_low: 0xffff,
                attr_low: default_data_attributes as u8,
                attr_high: (default_data_attributes >> 8) as u8,
                ..GdtEntry::new_zeroed()
            },
            GdtEntry::new_zeroed(),
        ];
        let linear_code64_selector = size_of::<GdtEntry>() as u16;
        let linear_selector = 2 * size_of::<GdtEntry>() as u16;

        let base = self.allocate(PAGE_SIZE_4K, PAGE_SIZE_4K, "gdt")?;
        self.write(base, gdt.as_bytes())?;

        self.vmsa.gdtr = SevSelector {
            selector: 0,
            attrib: 0,
            limit: (size_of_val(&gdt) - 1) as u32,
            base,
        };
        self.vmsa.cs = self.import_vmsa_segment(linear_code64_selector, default_code_attributes);
        let ds = self.import_vmsa_segment(linear_selector, default_data_attributes);
        self.vmsa.ds = ds;
        self.vmsa.es = ds;
        self.vmsa.fs = ds;
        self.vmsa.gs = ds;
        self.vmsa.ss = ds;

        Ok(MemoryRange::new(base..base + PAGE_SIZE_4K))
    }

    fn setup_idt(&mut self) -> anyhow::Result<MemoryRange> {
        // An empty IDT: any early exception triple faults instead of running
        // off into unmapped memory. The allocated page stays unwritten and is
        // zero filled at finalize.
        let base = self.allocate(PAGE_SIZE_4K, PAGE_SIZE_4K, "idt")?;

        self.vmsa.idtr = SevSelector {
            selector: 0,
            attrib: 0,
            limit: 0xfff,
            base,
        };

        Ok(MemoryRange::new(base..base + PAGE_SIZE_4K))
    }

    fn import_vp_register(&mut self, register: X86Register) -> anyhow::Result<()> {
        match register {
            X86Register::Rip(rip) => self.vmsa.rip = rip,
            X86Register::Rsi(rsi) => self.vmsa.rsi = rsi,
            X86Register::Rsp(rsp) => self.vmsa.rsp = rsp,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loader_defs::PAGE_SIZE;

    fn new_loader() -> IgvmImageLoader {
        IgvmImageLoader::new(SnpPolicy::from(DEFAULT_SNP_POLICY)).unwrap()
    }

    #[test]
    fn overlapping_allocation_fails() {
        let mut loader = new_loader();
        loader.seek(0x100000);
        loader.allocate(0x3000, PAGE_SIZE, "first").unwrap();
        loader.seek(0x101000);
        assert!(loader.allocate(PAGE_SIZE, PAGE_SIZE, "second").is_err());
    }

    #[test]
    fn write_outside_allocation_fails() {
        let mut loader = new_loader();
        loader.seek(0x100000);
        loader.allocate(PAGE_SIZE, PAGE_SIZE, "page").unwrap();
        assert!(loader.write(0x100000, &[1, 2, 3]).is_ok());
        assert!(loader.write(0x101000, &[1, 2, 3]).is_err());
        // A write that starts inside the allocation but runs past its end.
        assert!(loader.write(0x100ffe, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn unaligned_write_lands_at_page_offset() {
        let mut loader = new_loader();
        loader.seek(0xe0000);
        loader.allocate(PAGE_SIZE, PAGE_SIZE, "acpi").unwrap();
        loader.write(0xe0024, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();

        let binary = loader.finalize().unwrap();
        let file = IgvmFile::new_from_binary(&binary, None).unwrap();
        let data = file
            .directives()
            .iter()
            .find_map(|directive| match directive {
                IgvmDirectiveHeader::PageData { gpa, data, .. } if *gpa == 0xe0000 => Some(data),
                _ => None,
            })
            .expect("page directive for the acpi page");
        assert_eq!(data.len(), PAGE_SIZE as usize);
        assert_eq!(&data[0x24..0x28], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert!(data[..0x24].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_spanning_pages_fills_both_buffers() {
        let mut loader = new_loader();
        loader.seek(0x100000);
        loader.allocate(2 * PAGE_SIZE, PAGE_SIZE, "pair").unwrap();
        loader.write(0x100ffe, &[1, 2, 3, 4]).unwrap();

        let low = &loader.page_contents[&(0x100000 / PAGE_SIZE)];
        let high = &loader.page_contents[&(0x101000 / PAGE_SIZE)];
        assert_eq!(&low[0xffe..], &[1, 2]);
        assert_eq!(&high[..2], &[3, 4]);
    }

    #[test]
    fn writes_to_one_page_merge() {
        let mut loader = new_loader();
        loader.seek(0xe0000);
        loader.allocate(PAGE_SIZE, PAGE_SIZE, "acpi").unwrap();
        loader.write(0xe0000, &[1; 0x24]).unwrap();
        loader.write(0xe0024, &[2; 0x10]).unwrap();

        let page = &loader.page_contents[&(0xe0000 / PAGE_SIZE)];
        assert!(page[..0x24].iter().all(|&b| b == 1));
        assert!(page[0x24..0x34].iter().all(|&b| b == 2));
    }

    #[test]
    fn cursor_advances_and_aligns() {
        let mut loader = new_loader();
        loader.seek(0x100000);
        let first = loader.allocate(0x1800, PAGE_SIZE, "first").unwrap();
        assert_eq!(first, 0x100000);
        let second = loader.allocate(PAGE_SIZE, PAGE_SIZE, "second").unwrap();
        assert_eq!(second, 0x102000);
    }

    #[test]
    fn paging_configures_long_mode() {
        let mut loader = new_loader();
        loader.seek(0x200000);
        let range = loader.setup_paging(4).unwrap();
        assert_eq!(range.start(), 0x200000);
        assert_eq!(range.len(), IDENTITY_MAP_PAGE_COUNT * PAGE_SIZE);

        assert_eq!(loader.vmsa.cr3, 0x200000);
        assert_eq!(loader.vmsa.cr0, X64_CR0_PE | X64_CR0_PG);
        assert_eq!(loader.vmsa.cr4, X64_CR4_PAE);
        assert_ne!(loader.vmsa.efer & X64_EFER_SVME, 0);
        assert_ne!(loader.vmsa.efer & X64_EFER_LMA, 0);
    }

    #[test]
    fn non_4_level_paging_rejected() {
        let mut loader = new_loader();
        loader.seek(0x200000);
        assert!(loader.setup_paging(5).is_err());
    }

    #[test]
    fn gdt_selectors() {
        let mut loader = new_loader();
        loader.seek(0x200000);
        loader.setup_gdt().unwrap();

        assert_eq!(loader.vmsa.gdtr.base, 0x200000);
        assert_eq!(loader.vmsa.gdtr.limit, 0x1f);
        assert_eq!(loader.vmsa.cs.selector, 8);
        assert_eq!(loader.vmsa.ds.selector, 16);
        assert_eq!(loader.vmsa.ss.selector, loader.vmsa.ds.selector);
        assert_eq!(loader.vmsa.ss.attrib, loader.vmsa.ds.attrib);
        // 0xa09b packs to 0xa9b in VMSA attrib format.
        assert_eq!(loader.vmsa.cs.attrib, 0xa9b);
        assert_eq!(loader.vmsa.ds.attrib, 0xc93);
    }

    #[test]
    fn finalize_produces_igvm_file() {
        let mut loader = new_loader();
        loader.seek(0x100000);
        loader.allocate(PAGE_SIZE, PAGE_SIZE, "data").unwrap();
        loader.write(0x100000, &[0xcc; 16]).unwrap();
        loader
            .import_vp_register(X86Register::Rip(0x100000))
            .unwrap();

        let binary = loader.finalize().unwrap();
        let file = IgvmFile::new_from_binary(&binary, None).unwrap();
        assert_eq!(file.platforms().len(), 1);
        assert_eq!(file.initializations().len(), 1);

        // CPUID window, data page, vmsa.
        let mut has_vp_context = false;
        let mut page_gpas = Vec::new();
        for directive in file.directives() {
            match directive {
                IgvmDirectiveHeader::SnpVpContext { vmsa, .. } => {
                    has_vp_context = true;
                    assert_eq!(vmsa.rip, 0x100000);
                }
                IgvmDirectiveHeader::PageData { gpa, .. } => page_gpas.push(*gpa),
                _ => {}
            }
        }
        assert!(has_vp_context);
        assert!(page_gpas.contains(&0x100000));
        assert!(page_gpas.contains(&SNP_CPUID_PAGE_BASE));
    }
}
