use agfs::Fs;
use anyhow::Result;
use clap::Parser;

use crate::{cli::Cli, fuse3::FuseFs};

mod cli;
mod fuse3;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let fs = FuseFs::new(Fs::open(&cli.device)?);
	let opts = cli.options();

	if cli.foreground {
		fuser::mount2(fs, &cli.mountpoint, &opts)?;
	} else {
		fuser::spawn_mount2(fs, &cli.mountpoint, &opts)?;
	}

	Ok(())
}
