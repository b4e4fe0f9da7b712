// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Orchestration of the guest-physical address map for an SEV-SNP guest
//! booting a Linux boot-protocol kernel pair.
//!
//! The five stages here run strictly in order over the substrate's bump
//! allocator: ACPI placement, primary kernel, privileged setup, boot
//! parameters and stack, VMPL2 kernel. Each stage starts where the previous
//! one left the allocation cursor, so reordering them changes the guest
//! address map.

use crate::e820::build_memory_map;
use crate::e820::MemoryMapOverflow;
use crate::e820::MemoryMapParams;
use crate::header::build_primary_header;
use crate::header::validate_secondary_header;
use crate::header::HeaderError;
use crate::importer::GuestStructView;
use crate::importer::ImageBuild;
use crate::importer::X86Register;
use crate::range::MemoryRange;
use loader_defs::linux as defs;
use loader_defs::PAGE_SIZE;
use std::collections::BTreeMap;
use thiserror::Error;

/// Base of the window reserved for firmware; nothing below this is written.
pub const BIOS_RESERVED_END: u64 = 0xa0000;

/// GPA of the ACPI RSDP table, reported to the kernel in `boot_params`.
pub const ACPI_RSDP_ADDR: u64 = 0xe0000;

/// Base of the reserved 4-page window holding the SNP CPUID, extended-state
/// CPUID, and secrets pages. Sized so the window ends exactly at the BIOS
/// boundary.
pub const SNP_CPUID_PAGE_BASE: u64 = 0x9c000;

/// Fixed load address of the VMPL2 kernel.
pub const VMPL2_KERNEL_BASE: u64 = 0x2d00000;

/// Size of the boot stack, in pages. The stack pointer starts one page up,
/// leaving the lower page as guard/scratch.
const BOOT_STACK_PAGES: u64 = 2;

/// Minimum end of the firmware data window. The memory map carves the ACPI
/// region out above 1MiB, so the window must reach at least that far.
pub const ACPI_WINDOW_MIN_END: u64 = 0x100000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("VMPL2 kernel boot header validation failed")]
    Header(#[source] HeaderError),
    #[error("ACPI window end {0:#x} is below the minimum {ACPI_WINDOW_MIN_END:#x}")]
    AcpiWindowTooSmall(u64),
    #[error("memory map assembly failed")]
    MemoryMap(#[source] MemoryMapOverflow),
    #[error("importer error")]
    Importer(#[source] anyhow::Error),
}

/// The primary kernel to load.
pub struct KernelConfig<'a> {
    /// Flat binary image of the kernel.
    pub bytes: &'a [u8],
    /// Page-aligned GPA to load the kernel at, supplied by the build
    /// configuration.
    pub start_address: u64,
    /// Byte offset of the entry point within the flat image, derived from the
    /// object file's entry point and code section base.
    pub entry_offset: u64,
}

/// The externally generated ACPI table set, keyed by destination GPA.
pub struct AcpiConfig<'a> {
    pub tables: &'a BTreeMap<u64, Vec<u8>>,
    /// First address past the table window; everything in
    /// `[0xa0000, end_address)` is claimed for firmware data. Must be at
    /// least [`ACPI_WINDOW_MIN_END`].
    pub end_address: u64,
}

/// Information returned about the kernel loaded.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KernelInfo {
    /// The base gpa the kernel was loaded at.
    pub gpa: u64,
    /// The size in bytes of the kernel image.
    pub size: u64,
    /// The gpa of the entrypoint of the kernel.
    pub entrypoint: u64,
}

/// Information returned about where the guest image's parts were placed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadInfo {
    /// The primary kernel placement.
    pub kernel: KernelInfo,
    /// The gpa of the boot-parameters block.
    pub boot_params_gpa: u64,
    /// The gpa of the base (guard page) of the boot stack.
    pub boot_stack_gpa: u64,
    /// The VMPL2 kernel placement: base and raw byte size.
    pub vmpl2_kernel: (u64, u64),
    /// Number of e820 entries written into the boot-parameters block.
    pub memory_map_entries: u8,
}

/// Append `range` to `regions`, coalescing with the previous region when
/// contiguous.
fn push_validated_ram(regions: &mut Vec<MemoryRange>, range: MemoryRange) {
    if let Some(last) = regions.last_mut() {
        if last.end() == range.start() {
            *last = MemoryRange::new(last.start()..range.end());
            return;
        }
    }
    regions.push(range);
}

/// Assemble the complete initial memory image and BSP entry state for an
/// SEV-SNP guest.
///
/// Fails fast on a VMPL2 header violation before touching guest memory; any
/// later failure likewise aborts the run, as a half-built image is never a
/// valid output.
pub fn load_snp_kernel(
    importer: &mut dyn ImageBuild,
    kernel: KernelConfig<'_>,
    vmpl2_kernel: &[u8],
    acpi: AcpiConfig<'_>,
) -> Result<LoadInfo, Error> {
    let vmpl2_header = validate_secondary_header(vmpl2_kernel).map_err(Error::Header)?;
    tracing::debug!(
        pref_address = format_args!("{:#x}", vmpl2_header.pref_address.get()),
        init_size = format_args!("{:#x}", vmpl2_header.init_size.get()),
        "validated VMPL2 kernel header"
    );
    if acpi.end_address < ACPI_WINDOW_MIN_END {
        return Err(Error::AcpiWindowTooSmall(acpi.end_address));
    }

    // Stage 1: claim the firmware window and place the ACPI tables, in
    // ascending GPA order.
    importer.seek(BIOS_RESERVED_END);
    importer
        .allocate(acpi.end_address - BIOS_RESERVED_END, PAGE_SIZE, "acpi")
        .map_err(Error::Importer)?;
    for (&gpa, data) in acpi.tables {
        importer.write(gpa, data).map_err(Error::Importer)?;
    }
    importer.seek(acpi.end_address);

    // Stage 2: primary kernel at the configured start address.
    tracing::trace!(
        start_address = format_args!("{:#x}", kernel.start_address),
        "loading primary kernel"
    );
    importer.seek(kernel.start_address);
    importer
        .allocate(kernel.bytes.len() as u64, PAGE_SIZE, "kernel")
        .map_err(Error::Importer)?;
    importer
        .write(kernel.start_address, kernel.bytes)
        .map_err(Error::Importer)?;
    let kernel_entry = kernel.start_address + kernel.entry_offset;

    // Stage 3: privileged setup. Every byte the substrate consumes here must
    // be declared back to the guest as usable RAM.
    let mut extra_validated_ram = Vec::new();
    let paging = importer.setup_paging(4).map_err(Error::Importer)?;
    push_validated_ram(&mut extra_validated_ram, paging);
    let gdt = importer.setup_gdt().map_err(Error::Importer)?;
    push_validated_ram(&mut extra_validated_ram, gdt);
    let idt = importer.setup_idt().map_err(Error::Importer)?;
    push_validated_ram(&mut extra_validated_ram, idt);

    // Stage 4: boot-parameters block and boot stack.
    let boot_params_gpa = importer
        .allocate(size_of::<defs::boot_params>() as u64, PAGE_SIZE, "boot-params")
        .map_err(Error::Importer)?;
    let boot_stack_gpa = importer
        .allocate(BOOT_STACK_PAGES * PAGE_SIZE, PAGE_SIZE, "boot-stack")
        .map_err(Error::Importer)?;
    push_validated_ram(
        &mut extra_validated_ram,
        MemoryRange::new(boot_params_gpa..boot_stack_gpa + BOOT_STACK_PAGES * PAGE_SIZE),
    );

    // Populate the block through a scoped view; the exclusive borrow keeps
    // the allocator untouched until commit.
    let memory_map_entries;
    {
        let mut params = GuestStructView::<defs::boot_params>::new(importer, boot_params_gpa);
        params.hdr = build_primary_header(kernel.bytes.len(), kernel.start_address);
        params.acpi_rsdp_addr = ACPI_RSDP_ADDR.into();
        memory_map_entries = build_memory_map(
            &mut params.e820_map,
            &MemoryMapParams {
                acpi_end: acpi.end_address,
                cpuid_page_base: SNP_CPUID_PAGE_BASE,
                kernel_base: kernel.start_address,
                kernel_size: kernel.bytes.len() as u64,
                extra_validated_ram: &extra_validated_ram,
                vmpl2_base: VMPL2_KERNEL_BASE,
                vmpl2_size: vmpl2_kernel.len() as u64,
            },
        )
        .map_err(Error::MemoryMap)?;
        params.e820_entries = memory_map_entries;
        params.commit().map_err(Error::Importer)?;
    }

    // Wire the BSP entry state.
    let mut import_reg = |register| {
        importer
            .import_vp_register(register)
            .map_err(Error::Importer)
    };
    import_reg(X86Register::Rip(kernel_entry))?;
    import_reg(X86Register::Rsi(boot_params_gpa))?;
    import_reg(X86Register::Rsp(boot_stack_gpa + PAGE_SIZE))?;

    // Stage 5: VMPL2 kernel at its fixed address.
    importer.seek(VMPL2_KERNEL_BASE);
    importer
        .allocate(vmpl2_kernel.len() as u64, PAGE_SIZE, "vmpl2-kernel")
        .map_err(Error::Importer)?;
    importer
        .write(VMPL2_KERNEL_BASE, vmpl2_kernel)
        .map_err(Error::Importer)?;

    Ok(LoadInfo {
        kernel: KernelInfo {
            gpa: kernel.start_address,
            size: kernel.bytes.len() as u64,
            entrypoint: kernel_entry,
        },
        boot_params_gpa,
        boot_stack_gpa,
        vmpl2_kernel: (VMPL2_KERNEL_BASE, vmpl2_kernel.len() as u64),
        memory_map_entries,
    })
}
