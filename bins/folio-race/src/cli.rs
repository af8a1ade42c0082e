//! CLI definitions for folio-race

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use folio_race_core::{ReproConfig, WaitStrategy};

/// Reproduce the folio split deadlock between MADV_COLLAPSE and UFFDIO_MOVE
#[derive(Parser, Debug)]
#[command(name = "folio-race")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Make the source huge-page eligible and collapse it every iteration (0 or 1)
    #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub coalesce: bool,

    /// Number of reader threads
    pub workers: usize,

    /// Number of move/validate/swap iterations
    pub iterations: usize,

    /// Region size (e.g., 4M, 64K)
    #[arg(long, default_value = "4M", value_parser = parse_size)]
    pub region_size: u64,

    /// How threads wait on each other
    #[arg(long, value_enum, default_value = "spin")]
    pub wait: WaitArg,

    /// First address tried for the source region (hex)
    #[arg(long, default_value = "0x23400000", value_parser = parse_hex)]
    pub source_hint: usize,

    /// Run against the in-process simulated kernel instead of userfaultfd
    #[arg(long)]
    pub simulate: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitArg {
    /// Busy-wait (keeps the race timing)
    Spin,
    /// Spin briefly, then yield the CPU
    Yield,
}

impl WaitArg {
    pub fn to_strategy(self) -> WaitStrategy {
        match self {
            WaitArg::Spin => WaitStrategy::Spin,
            WaitArg::Yield => WaitStrategy::yielding(),
        }
    }
}

impl Cli {
    /// Build and validate the engine configuration
    pub fn to_config(&self) -> anyhow::Result<ReproConfig> {
        let region_len = usize::try_from(self.region_size)?;
        let config = ReproConfig::new(self.coalesce, self.workers, self.iterations)
            .with_region_len(region_len)
            .with_wait(self.wait.to_strategy())
            .with_source_hint(self.source_hint);
        config.validate()?;
        Ok(config)
    }
}

/// Parse size string (e.g., "4M", "2G", "512K")
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().to_uppercase();
    let (num, shift) = if let Some(n) = s.strip_suffix("TIB").or_else(|| s.strip_suffix('T')) {
        (n, 40)
    } else if let Some(n) = s.strip_suffix("GIB").or_else(|| s.strip_suffix('G')) {
        (n, 30)
    } else if let Some(n) = s.strip_suffix("MIB").or_else(|| s.strip_suffix('M')) {
        (n, 20)
    } else if let Some(n) = s.strip_suffix("KIB").or_else(|| s.strip_suffix('K')) {
        (n, 10)
    } else {
        (s.as_str(), 0)
    };

    let num: u64 = num.trim().parse()?;
    num.checked_mul(1u64 << shift)
        .ok_or_else(|| anyhow::anyhow!("size {s} overflows"))
}

/// Parse an address with or without a `0x` prefix
pub fn parse_hex(s: &str) -> anyhow::Result<usize> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    Ok(usize::from_str_radix(digits, 16)?)
}
