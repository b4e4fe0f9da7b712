// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loading of externally generated ACPI tables destined for the firmware
//! window.

use loader::align_up_to_page_size;
use loader::linux::BIOS_RESERVED_END;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Default first address past the ACPI window when no table extends beyond
/// it: one page past the 1MB boundary.
pub const DEFAULT_ACPI_END: u64 = 0x101000;

/// Well-known GPA of the RSDP, matching `acpi_rsdp_addr` in the
/// boot-parameters block.
const RSDP_GPA: u64 = loader::linux::ACPI_RSDP_ADDR;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read ACPI table directory")]
    Io(#[from] std::io::Error),
    #[error("ACPI table file name {0:?} is not a hex GPA")]
    InvalidFileName(String),
    #[error("ACPI table at {0:#x} is below the firmware window base {BIOS_RESERVED_END:#x}")]
    TableBelowWindow(u64),
}

/// A set of ACPI tables keyed by destination GPA, with the end of the window
/// they claim.
#[derive(Debug)]
pub struct AcpiTables {
    pub tables: BTreeMap<u64, Vec<u8>>,
    pub end_address: u64,
}

impl AcpiTables {
    /// The smallest usable table set: a single ACPI 1.0 RSDP at the
    /// well-known GPA with a null RSDT pointer. The window still claims up to
    /// [`DEFAULT_ACPI_END`] so the guest sees a stable firmware region.
    pub fn minimal() -> Self {
        let mut rsdp = [0u8; 20];
        rsdp[..8].copy_from_slice(b"RSD PTR ");
        rsdp[9..15].copy_from_slice(b"SNPGEN");
        // Fix up the checksum so the table bytes sum to zero.
        let sum = rsdp.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        rsdp[8] = sum.wrapping_neg();

        let mut tables = BTreeMap::new();
        tables.insert(RSDP_GPA, rsdp.to_vec());
        Self {
            tables,
            end_address: DEFAULT_ACPI_END,
        }
    }

    /// Read tables from a directory of `<hex-gpa>.bin` files, where the file
    /// name is the destination GPA. Files with other extensions are ignored.
    pub fn from_dir(dir: &Path) -> Result<Self, Error> {
        let mut tables = BTreeMap::new();
        let mut end_address = DEFAULT_ACPI_END;

        for entry in fs_err::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }

            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| Error::InvalidFileName(entry.file_name().to_string_lossy().into()))?;
            let gpa = u64::from_str_radix(stem.trim_start_matches("0x"), 16)
                .map_err(|_| Error::InvalidFileName(stem.to_string()))?;
            if gpa < BIOS_RESERVED_END {
                return Err(Error::TableBelowWindow(gpa));
            }

            let data = fs_err::read(&path)?;
            end_address = end_address.max(align_up_to_page_size(gpa + data.len() as u64));
            tracing::debug!(
                gpa = format_args!("{gpa:#x}"),
                len = data.len(),
                "loaded ACPI table"
            );
            tables.insert(gpa, data);
        }

        Ok(Self {
            tables,
            end_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_set_has_checksummed_rsdp() {
        let acpi = AcpiTables::minimal();
        assert_eq!(acpi.end_address, DEFAULT_ACPI_END);

        let rsdp = &acpi.tables[&RSDP_GPA];
        assert_eq!(&rsdp[..8], b"RSD PTR ");
        let sum = rsdp.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn reads_tables_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("e0000.bin"), [1u8; 36]).unwrap();
        std::fs::write(dir.path().join("0xf0000.bin"), [2u8; 0x100]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let acpi = AcpiTables::from_dir(dir.path()).unwrap();
        assert_eq!(acpi.tables.len(), 2);
        assert_eq!(acpi.tables[&0xe0000].len(), 36);
        assert_eq!(acpi.tables[&0xf0000].len(), 0x100);
        assert_eq!(acpi.end_address, DEFAULT_ACPI_END);
    }

    #[test]
    fn unaligned_table_gpa_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("e0024.bin"), [3u8; 0x40]).unwrap();

        let acpi = AcpiTables::from_dir(dir.path()).unwrap();
        assert_eq!(acpi.tables[&0xe0024].len(), 0x40);
        assert_eq!(acpi.end_address, DEFAULT_ACPI_END);
    }

    #[test]
    fn table_past_default_extends_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("101800.bin"), [0u8; 0x20]).unwrap();

        let acpi = AcpiTables::from_dir(dir.path()).unwrap();
        assert_eq!(acpi.end_address, 0x102000);
    }

    #[test]
    fn rejects_table_below_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1000.bin"), [0u8; 8]).unwrap();

        assert!(matches!(
            AcpiTables::from_dir(dir.path()),
            Err(Error::TableBelowWindow(0x1000))
        ));
    }

    #[test]
    fn rejects_bad_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rsdp.bin"), [0u8; 8]).unwrap();

        assert!(matches!(
            AcpiTables::from_dir(dir.path()),
            Err(Error::InvalidFileName(_))
        ));
    }
}
