use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Format a regular file as a new agfs device.
#[derive(Parser)]
#[command(name = "mkfs.agfs", version, about)]
struct Cli {
	/// Path to the backing file; created if it doesn't already exist
	device: PathBuf,

	/// Number of Allocation Groups to divide the device into
	#[arg(short = 'g', long, default_value_t = agfs::DEFAULT_AG_COUNT)]
	ag_count: u32,

	/// Total device size in bytes, required when `device` doesn't exist yet
	#[arg(short, long)]
	size: Option<u64>,
}

fn main() -> Result<()> {
	env_logger::builder().filter_level(log::LevelFilter::Info).init();
	let cli = Cli::parse();

	let total_blocks = match cli.size {
		Some(bytes) => bytes / agfs::BLOCK_SIZE as u64,
		None => {
			let meta = std::fs::metadata(&cli.device)?;
			meta.len() / agfs::BLOCK_SIZE as u64
		}
	};

	agfs::format(&cli.device, cli.ag_count, total_blocks)?;
	log::info!(
		"formatted {} as agfs: {} AGs, {total_blocks} blocks",
		cli.device.display(),
		cli.ag_count
	);
	Ok(())
}
