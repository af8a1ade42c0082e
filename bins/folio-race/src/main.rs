//! folio-race - reproducer for the folio split deadlock between
//! MADV_COLLAPSE and UFFDIO_MOVE
//!
//! # Usage
//!
//! ```bash
//! # 4 readers, huge pages on, 1000 iterations
//! folio-race 1 4 1000
//!
//! # Exercise the engine on a kernel without UFFD_FEATURE_MOVE
//! folio-race 0 2 10 --simulate --wait yield
//! ```
//!
//! A healthy kernel prints one `iteration <n> completed` line per iteration
//! and exits 0. An affected kernel hangs inside UFFDIO_MOVE.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use folio_race_core::{Driver, KernelShim, RealKernel, SimKernel};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.to_config()?;

    let kernel: Arc<dyn KernelShim> = if cli.simulate {
        tracing::info!("Using simulated kernel");
        Arc::new(SimKernel::new())
    } else {
        Arc::new(RealKernel::new())
    };

    let driver = Driver::setup(kernel, config).context("reproducer setup failed")?;
    println!(
        "Address returned by mmap() = from:{:#x}, to:{:#x}",
        driver.regions().source().base(),
        driver.regions().destination().base()
    );

    let summary = driver
        .run(|report| println!("iteration {} completed", report.iteration))
        .context("reproducer run failed")?;

    tracing::info!(
        iterations = summary.iterations,
        coalesce_refusals = summary.coalesce_refusals,
        moved = summary.relocation.moved,
        faults = summary.relocation.faults,
        "Done"
    );
    Ok(())
}
