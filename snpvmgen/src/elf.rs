// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flattening of ELF kernel images into loadable binary blobs.
//!
//! The primary kernel is shipped as an ELF executable. The guest gets the raw
//! binary produced by `objcopy -O binary`, and enters at the ELF entry point
//! expressed as an offset from the start of `.text` (which `objcopy` places at
//! the start of the flat image).

use object::elf;
use object::read::elf::FileHeader;
use object::read::elf::SectionHeader;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

type LE = object::LittleEndian;
const LE: LE = LE {};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run {tool}")]
    ToolLaunch {
        tool: String,
        #[source]
        err: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    ExternalToolFailure {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("unable to read ELF file header")]
    ReadFileHeader,
    #[error("ELF file is big endian, only little endian supported")]
    BigEndianElfOnLe,
    #[error("unsupported ELF machine type {0:#x}")]
    UnsupportedMachine(u16),
    #[error("unable to read ELF section headers")]
    ReadSectionHeaders(#[source] object::read::Error),
    #[error("ELF file has no .text section")]
    NoTextSection,
    #[error("entry point {e_entry:#x} is below the .text base {text_base:#x}")]
    EntryBeforeText { e_entry: u64, text_base: u64 },
}

/// A kernel image flattened for direct placement in guest memory.
#[derive(Debug)]
pub struct FlattenedKernel {
    /// The raw binary image.
    pub bytes: Vec<u8>,
    /// Byte offset of the entry point from the start of the image.
    pub entry_offset: u64,
}

fn compute_entry_offset(e_entry: u64, text_base: u64) -> Result<u64, Error> {
    e_entry
        .checked_sub(text_base)
        .ok_or(Error::EntryBeforeText { e_entry, text_base })
}

/// Parse the ELF at `elf_data` and return the entry point's offset from the
/// base of `.text`.
pub fn entry_offset(elf_data: &[u8]) -> Result<u64, Error> {
    let ehdr: &elf::FileHeader64<LE> =
        elf::FileHeader64::parse(elf_data).map_err(|_| Error::ReadFileHeader)?;
    if ehdr.is_big_endian() {
        return Err(Error::BigEndianElfOnLe);
    }
    if ehdr.e_machine.get(LE) != elf::EM_X86_64 {
        return Err(Error::UnsupportedMachine(ehdr.e_machine.get(LE)));
    }

    let sections = ehdr
        .sections(LE, elf_data)
        .map_err(Error::ReadSectionHeaders)?;
    let (_, text) = sections
        .section_by_name(LE, b".text")
        .ok_or(Error::NoTextSection)?;

    compute_entry_offset(ehdr.e_entry.get(LE), text.sh_addr(LE))
}

/// Flatten the ELF at `elf_path` with `objcopy_tool` and compute the entry
/// offset from the ELF headers.
pub fn flatten_kernel(objcopy_tool: &str, elf_path: &Path) -> Result<FlattenedKernel, Error> {
    let elf_data = fs_err::read(elf_path)?;
    let entry_offset = entry_offset(&elf_data)?;

    let flat = tempfile::NamedTempFile::new()?;
    let output = Command::new(objcopy_tool)
        .arg("-O")
        .arg("binary")
        .arg(elf_path)
        .arg(flat.path())
        .output()
        .map_err(|err| Error::ToolLaunch {
            tool: objcopy_tool.to_string(),
            err,
        })?;
    if !output.status.success() {
        return Err(Error::ExternalToolFailure {
            tool: objcopy_tool.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let bytes = fs_err::read(flat.path())?;
    tracing::debug!(
        len = bytes.len(),
        entry_offset = format_args!("{entry_offset:#x}"),
        "flattened kernel image"
    );
    Ok(FlattenedKernel {
        bytes,
        entry_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_offset_from_text_base() {
        assert_eq!(compute_entry_offset(0x2000020, 0x2000000).unwrap(), 0x20);
        assert_eq!(compute_entry_offset(0x2000000, 0x2000000).unwrap(), 0);
    }

    #[test]
    fn entry_below_text_rejected() {
        assert!(matches!(
            compute_entry_offset(0x1fff000, 0x2000000),
            Err(Error::EntryBeforeText {
                e_entry: 0x1fff000,
                text_base: 0x2000000,
            })
        ));
    }

    #[test]
    fn garbage_is_not_an_elf() {
        assert!(matches!(
            entry_offset(&[0u8; 16]),
            Err(Error::ReadFileHeader)
        ));
    }

    #[test]
    fn failing_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let elf_path = dir.path().join("kernel.elf");
        std::fs::write(&elf_path, minimal_elf()).unwrap();

        let err = flatten_kernel("false", &elf_path).unwrap_err();
        match err {
            Error::ExternalToolFailure { tool, status, .. } => {
                assert_eq!(tool, "false");
                assert!(!status.success());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    /// A minimal x86-64 ELF: file header, one `.text` section header, and a
    /// section header string table.
    fn minimal_elf() -> Vec<u8> {
        let mut elf = vec![0u8; 0x200];

        // e_ident
        elf[0..4].copy_from_slice(b"\x7fELF");
        elf[4] = elf::ELFCLASS64;
        elf[5] = elf::ELFDATA2LSB;
        elf[6] = 1; // EV_CURRENT

        let put16 = |elf: &mut [u8], off: usize, v: u16| {
            elf[off..off + 2].copy_from_slice(&v.to_le_bytes())
        };
        let put32 = |elf: &mut [u8], off: usize, v: u32| {
            elf[off..off + 4].copy_from_slice(&v.to_le_bytes())
        };
        let put64 = |elf: &mut [u8], off: usize, v: u64| {
            elf[off..off + 8].copy_from_slice(&v.to_le_bytes())
        };

        put16(&mut elf, 0x10, elf::ET_EXEC);
        put16(&mut elf, 0x12, elf::EM_X86_64);
        put32(&mut elf, 0x14, 1); // e_version
        put64(&mut elf, 0x18, 0x2000040); // e_entry
        put64(&mut elf, 0x28, 0x40); // e_shoff
        put16(&mut elf, 0x34, 0x40); // e_ehsize
        put16(&mut elf, 0x3a, 0x40); // e_shentsize
        put16(&mut elf, 0x3c, 3); // e_shnum: null, .text, .shstrtab
        put16(&mut elf, 0x3e, 2); // e_shstrndx

        // Section header 1: .text at va 0x2000000.
        let sh1 = 0x40 + 0x40;
        put32(&mut elf, sh1, 1); // sh_name -> ".text"
        put32(&mut elf, sh1 + 4, 1); // SHT_PROGBITS
        put64(&mut elf, sh1 + 0x10, 0x2000000); // sh_addr
        put64(&mut elf, sh1 + 0x18, 0x1a0); // sh_offset
        put64(&mut elf, sh1 + 0x20, 0x10); // sh_size

        // Section header 2: .shstrtab.
        let sh2 = 0x40 + 2 * 0x40;
        put32(&mut elf, sh2, 7); // sh_name -> ".shstrtab"
        put32(&mut elf, sh2 + 4, 3); // SHT_STRTAB
        put64(&mut elf, sh2 + 0x18, 0x180); // sh_offset
        put64(&mut elf, sh2 + 0x20, 0x11); // sh_size

        elf[0x180..0x191].copy_from_slice(b"\0.text\0.shstrtab\0");
        elf
    }

    #[test]
    fn entry_offset_parses_minimal_elf() {
        assert_eq!(entry_offset(&minimal_elf()).unwrap(), 0x40);
    }
}
