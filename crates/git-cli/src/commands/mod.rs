pub mod index_pack;
pub mod verify_pack;

use anyhow::Result;
use clap::Subcommand;

use crate::Cli;

#[derive(Subcommand)]
pub enum Commands {
    /// Build pack index file for an existing or incoming packed archive
    IndexPack(index_pack::IndexPackArgs),
    /// Validate packed archive files
    VerifyPack(verify_pack::VerifyPackArgs),
}

pub fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::IndexPack(args) => index_pack::run(args, &cli),
        Commands::VerifyPack(args) => verify_pack::run(args, &cli),
    }
}
