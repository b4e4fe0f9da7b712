// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implements a command line utility to generate SEV-SNP guest memory images
//! in the IGVM format.

mod acpi;
mod elf;
mod file_loader;
mod pagetable;

use crate::acpi::AcpiTables;
use crate::file_loader::IgvmImageLoader;
use crate::file_loader::DEFAULT_SNP_POLICY;
use anyhow::bail;
use anyhow::Context;
use clap::Parser;
use igvm_defs::SnpPolicy;
use loader::header::MINIMUM_PREF_ADDRESS;
use loader::linux::load_snp_kernel;
use loader::linux::AcpiConfig;
use loader::linux::KernelConfig;
use loader_defs::PAGE_SIZE;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "snpvmgen",
    about = "Tool to generate SEV-SNP guest memory images in IGVM format"
)]
struct Options {
    /// ELF image of the primary kernel
    #[clap(long)]
    kernel: PathBuf,
    /// Flat binary image of the VMPL2 kernel, carrying a Linux boot header
    #[clap(long)]
    vmpl2_kernel: PathBuf,
    /// Load address of the primary kernel
    #[clap(long, value_parser = parse_address, default_value = "0x2000000")]
    start_addr: u64,
    /// Directory of ACPI tables named `<hex-gpa>.bin`
    #[clap(long)]
    acpi_dir: Option<PathBuf>,
    /// objcopy tool used to flatten the kernel
    #[clap(long, default_value = "objcopy")]
    objcopy: String,
    /// Output file path for the built igvm file
    #[clap(short = 'o', long)]
    output: PathBuf,
}

fn parse_address(value: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    let filter = if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::default().add_directive(LevelFilter::INFO.into())
    };
    tracing_subscriber::fmt()
        .log_internal_errors(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if opts.start_addr % PAGE_SIZE != 0 {
        bail!("start address {:#x} is not page aligned", opts.start_addr);
    }
    if opts.start_addr <= MINIMUM_PREF_ADDRESS {
        bail!(
            "start address {:#x} is within the low reserved region",
            opts.start_addr
        );
    }

    let acpi = match &opts.acpi_dir {
        Some(dir) => AcpiTables::from_dir(dir).context("loading ACPI tables")?,
        None => AcpiTables::minimal(),
    };

    let kernel = elf::flatten_kernel(&opts.objcopy, &opts.kernel)
        .context("flattening primary kernel")?;
    let vmpl2_kernel = fs_err::read(&opts.vmpl2_kernel).context("reading VMPL2 kernel")?;

    let mut loader = IgvmImageLoader::new(SnpPolicy::from(DEFAULT_SNP_POLICY))?;
    let load_info = load_snp_kernel(
        &mut loader,
        KernelConfig {
            bytes: &kernel.bytes,
            start_address: opts.start_addr,
            entry_offset: kernel.entry_offset,
        },
        &vmpl2_kernel,
        AcpiConfig {
            tables: &acpi.tables,
            end_address: acpi.end_address,
        },
    )
    .context("loading guest image")?;

    tracing::info!(
        kernel_gpa = format_args!("{:#x}", load_info.kernel.gpa),
        entrypoint = format_args!("{:#x}", load_info.kernel.entrypoint),
        boot_params_gpa = format_args!("{:#x}", load_info.boot_params_gpa),
        memory_map_entries = load_info.memory_map_entries,
        "loaded guest image"
    );

    let igvm_binary = loader.finalize().context("finalizing igvm file")?;
    let mut file = fs_err::File::create(&opts.output).context("creating output file")?;
    file.write_all(&igvm_binary)
        .context("writing output file")?;

    tracing::info!(
        path = %opts.output.display(),
        size = igvm_binary.len(),
        "wrote igvm file"
    );
    Ok(())
}
