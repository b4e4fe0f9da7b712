// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing, validation, and construction of Linux boot protocol setup
//! headers.

use crate::align_up_to_page_size;
use loader_defs::linux as defs;
use loader_defs::PAGE_SIZE;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;

/// Lowest GPA a boot-protocol kernel may prefer to load at.
pub const MINIMUM_PREF_ADDRESS: u64 = 3 * 1024 * 1024;

/// Setup header validation errors. Validation is fail-fast: the first failing
/// check in declaration order is the one reported.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("image too small to contain a setup header")]
    Truncated,
    #[error("invalid setup header signature {0:#x}")]
    InvalidSignature(u32),
    #[error("preferred load address {0:#x} is below 3MiB")]
    LoadAddressTooLow(u64),
    #[error("no 64-bit entry point present in xloadflags")]
    Missing64BitEntry,
    #[error("preferred load address {0:#x} is not page aligned")]
    UnalignedLoadAddress(u64),
    #[error("init_size {0:#x} is not page aligned")]
    UnalignedInitSize(u32),
}

/// Parse and validate the setup header embedded in a boot-protocol kernel
/// image at the fixed offset 0x1f1.
///
/// The checks run in a fixed order and stop at the first violation: signature,
/// minimum preferred address, 64-bit entry point flag, preferred address
/// alignment, init_size alignment. Callers may rely on that ordering.
pub fn validate_secondary_header(image: &[u8]) -> Result<defs::setup_header, HeaderError> {
    let header_bytes = image
        .get(defs::SETUP_HEADER_OFFSET..)
        .ok_or(HeaderError::Truncated)?;
    let (header, _) =
        defs::setup_header::read_from_prefix(header_bytes).map_err(|_| HeaderError::Truncated)?;

    if header.header.get() != defs::SETUP_HEADER_MAGIC {
        return Err(HeaderError::InvalidSignature(header.header.get()));
    }

    let pref_address = header.pref_address.get();
    if pref_address <= MINIMUM_PREF_ADDRESS {
        return Err(HeaderError::LoadAddressTooLow(pref_address));
    }

    if header.xloadflags.get() & defs::XLF_KERNEL_64 == 0 {
        return Err(HeaderError::Missing64BitEntry);
    }

    if pref_address % PAGE_SIZE != 0 {
        return Err(HeaderError::UnalignedLoadAddress(pref_address));
    }

    let init_size = header.init_size.get();
    if u64::from(init_size) % PAGE_SIZE != 0 {
        return Err(HeaderError::UnalignedInitSize(init_size));
    }

    Ok(header)
}

/// Construct the setup header for the primary kernel, which is built from a
/// flat binary rather than a boot-protocol image.
///
/// Unlike [`validate_secondary_header`], no validation is applied: the primary
/// kernel's load address is supplied by the build configuration, not an
/// external image.
pub fn build_primary_header(kernel_len: usize, start_address: u64) -> defs::setup_header {
    defs::setup_header {
        init_size: (align_up_to_page_size(kernel_len as u64) as u32).into(),
        pref_address: start_address.into(),
        ..FromZeros::new_zeroed()
    }
}
