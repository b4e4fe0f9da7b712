// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-visible definitions used when constructing the initial memory image
//! for an SEV-SNP guest: the Linux boot protocol structures and the small set
//! of x86 architectural definitions the generator needs.

#![forbid(unsafe_code)]

pub mod linux;
pub mod x86;

/// Size of a guest page, in bytes.
pub const PAGE_SIZE: u64 = 4096;
