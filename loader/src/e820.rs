// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Assembly of the e820 memory map handed to the booted kernel.

use crate::range::MemoryRange;
use loader_defs::linux as defs;
use loader_defs::PAGE_SIZE;
use thiserror::Error;

/// The assembled map needs more entries than the `boot_params` table can hold.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("memory map requires {0} entries, exceeding the table capacity of {max}", max = defs::E820_MAX_ENTRIES)]
pub struct MemoryMapOverflow(pub usize);

/// Inputs to the memory map builder. Every field is a result of an earlier
/// address-map stage; the builder itself performs no allocation.
#[derive(Debug)]
pub struct MemoryMapParams<'a> {
    /// First address past the ACPI table window. Must be at least 1MiB, the
    /// base of the ACPI entry carved out here.
    pub acpi_end: u64,
    /// Base of the reserved 4-page CPUID/secrets window.
    pub cpuid_page_base: u64,
    /// Primary kernel placement, raw (unaligned) byte size.
    pub kernel_base: u64,
    pub kernel_size: u64,
    /// Regions consumed by privileged setup, reported to the guest as RAM in
    /// accumulation order.
    pub extra_validated_ram: &'a [MemoryRange],
    /// VMPL2 kernel placement, raw byte size.
    pub vmpl2_base: u64,
    pub vmpl2_size: u64,
}

/// Number of pages in the reserved CPUID/secrets window.
pub const CPUID_RESERVED_PAGES: u64 = 4;

const BIOS_RESERVED_BASE: u64 = 0xa0000;
const ONE_MB: u64 = 0x100000;

/// Build the e820 table into `table`, returning the number of entries
/// written.
///
/// The emission order is a guest-visible contract and is deliberately not
/// sorted by address: sentinel, BIOS window, ACPI window, CPUID window,
/// primary kernel, extra validated RAM, VMPL2 kernel.
pub fn build_memory_map(
    table: &mut [defs::e820entry; defs::E820_MAX_ENTRIES],
    params: &MemoryMapParams<'_>,
) -> Result<u8, MemoryMapOverflow> {
    let required = 6 + params.extra_validated_ram.len();
    if required > defs::E820_MAX_ENTRIES {
        return Err(MemoryMapOverflow(required));
    }

    let entry = |addr: u64, size: u64, typ: u32| defs::e820entry {
        addr: addr.into(),
        size: size.into(),
        typ: typ.into(),
    };

    let mut count = 0;
    let mut push = |e: defs::e820entry| {
        table[count] = e;
        count += 1;
    };

    // Zero-length sentinel entry; the table always starts with it.
    push(entry(0, 0, defs::E820_RAM));
    push(entry(
        BIOS_RESERVED_BASE,
        ONE_MB - BIOS_RESERVED_BASE,
        defs::E820_RESERVED,
    ));
    push(entry(ONE_MB, params.acpi_end - ONE_MB, defs::E820_ACPI));
    push(entry(
        params.cpuid_page_base,
        CPUID_RESERVED_PAGES * PAGE_SIZE,
        defs::E820_RESERVED,
    ));
    push(entry(params.kernel_base, params.kernel_size, defs::E820_RAM));
    for region in params.extra_validated_ram {
        push(entry(region.start(), region.len(), defs::E820_RAM));
    }
    push(entry(
        params.vmpl2_base,
        params.vmpl2_size,
        defs::E820_RESERVED,
    ));

    for e in &table[..count] {
        tracing::debug!(
            addr = format_args!("{:#x}", e.addr.get()),
            end = format_args!("{:#x}", e.addr.get() + e.size.get()),
            typ = e.typ.get(),
            "e820 entry"
        );
    }

    Ok(count as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn table() -> [defs::e820entry; defs::E820_MAX_ENTRIES] {
        FromZeros::new_zeroed()
    }

    #[test]
    fn fixed_order_seven_entries() {
        let extra = [MemoryRange::new(0x3000..0x5000)];
        let params = MemoryMapParams {
            acpi_end: 0x101000,
            cpuid_page_base: 0x9c000,
            kernel_base: 0x1000000,
            kernel_size: 0x5000,
            extra_validated_ram: &extra,
            vmpl2_base: 0x2d00000,
            vmpl2_size: 0x4000,
        };

        let mut map = table();
        let count = build_memory_map(&mut map, &params).unwrap();
        assert_eq!(count, 7);

        let expect = [
            (0, 0, defs::E820_RAM),
            (0xa0000, 0x60000, defs::E820_RESERVED),
            (0x100000, 0x1000, defs::E820_ACPI),
            (0x9c000, 0x4000, defs::E820_RESERVED),
            (0x1000000, 0x5000, defs::E820_RAM),
            (0x3000, 0x2000, defs::E820_RAM),
            (0x2d00000, 0x4000, defs::E820_RESERVED),
        ];
        for (i, &(addr, size, typ)) in expect.iter().enumerate() {
            assert_eq!(map[i].addr.get(), addr, "entry {i} addr");
            assert_eq!(map[i].size.get(), size, "entry {i} size");
            assert_eq!(map[i].typ.get(), typ, "entry {i} type");
        }
        // Entries past the count stay zeroed.
        assert_eq!(map[7], defs::e820entry::new_zeroed());
    }

    #[test]
    fn overflow_detected() {
        let extra: Vec<_> = (0..123)
            .map(|i| MemoryRange::new((0x10000000 + i * 0x2000)..(0x10001000 + i * 0x2000)))
            .collect();
        let params = MemoryMapParams {
            acpi_end: 0x101000,
            cpuid_page_base: 0x9c000,
            kernel_base: 0x1000000,
            kernel_size: 0x5000,
            extra_validated_ram: &extra,
            vmpl2_base: 0x2d00000,
            vmpl2_size: 0x4000,
        };
        assert_eq!(
            build_memory_map(&mut table(), &params),
            Err(MemoryMapOverflow(129))
        );
    }

    #[test]
    fn at_capacity() {
        let extra: Vec<_> = (0..122)
            .map(|i| MemoryRange::new((0x10000000 + i * 0x2000)..(0x10001000 + i * 0x2000)))
            .collect();
        let params = MemoryMapParams {
            acpi_end: 0x101000,
            cpuid_page_base: 0x9c000,
            kernel_base: 0x1000000,
            kernel_size: 0x5000,
            extra_validated_ram: &extra,
            vmpl2_base: 0x2d00000,
            vmpl2_size: 0x4000,
        };
        assert_eq!(build_memory_map(&mut table(), &params), Ok(128));
    }
}
