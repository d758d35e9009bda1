use clap::{Parser, Subcommand};
use espfuse::{
    cli::{
        self, config::Config, connect, needs_confirmation, BurnBitArgs, BurnBlockDataArgs,
        BurnCustomMacArgs, BurnEfuseArgs, BurnKeyArgs, BurnKeyDigestArgs, CheckErrorArgs,
        ConnectArgs, ProtectArgs, SummaryArgs,
    },
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, propagate_version = true, version)]
struct Cli {
    #[command(flatten)]
    connect_args: ConnectArgs,
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Burn keys into key blocks and assign their purposes
    BurnKey(BurnKeyArgs),
    /// Burn the digest of secure boot public keys
    BurnKeyDigest(BurnKeyDigestArgs),
    /// Burn values into named eFuse fields
    BurnEfuse(BurnEfuseArgs),
    /// Disable reading of fields or blocks
    ReadProtectEfuse(ProtectArgs),
    /// Disable writing of fields or blocks
    WriteProtectEfuse(ProtectArgs),
    /// Burn the contents of files into blocks
    BurnBlockData(BurnBlockDataArgs),
    /// Burn single bits of a block
    BurnBit(BurnBitArgs),
    /// Burn a custom MAC address
    BurnCustomMac(BurnCustomMacArgs),
    /// Report coding errors in the blocks
    CheckError(CheckErrorArgs),
    /// Print the raw contents of every block
    Dump,
    /// Print the decoded value of every field
    Summary(SummaryArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let args = Cli::parse();
    debug!("{:#?}", args);

    let config = Config::load()?;
    let mut burner = connect(&args.connect_args, &config)?;
    let confirm = needs_confirmation(&args.connect_args, &config);

    match args.subcommand {
        Commands::BurnKey(args) => cli::burn_key(&mut burner, &args, confirm),
        Commands::BurnKeyDigest(args) => cli::burn_key_digest(&mut burner, &args, confirm),
        Commands::BurnEfuse(args) => cli::burn_efuse(&mut burner, &args, confirm),
        Commands::ReadProtectEfuse(args) => cli::read_protect_efuse(&mut burner, &args, confirm),
        Commands::WriteProtectEfuse(args) => cli::write_protect_efuse(&mut burner, &args, confirm),
        Commands::BurnBlockData(args) => cli::burn_block_data(&mut burner, &args, confirm),
        Commands::BurnBit(args) => cli::burn_bit(&mut burner, &args, confirm),
        Commands::BurnCustomMac(args) => cli::burn_custom_mac(&mut burner, &args, confirm),
        Commands::CheckError(args) => cli::check_error(&mut burner, &args),
        Commands::Dump => {
            cli::dump(&burner);
            Ok(())
        }
        Commands::Summary(args) => {
            cli::summary(&burner, &args);
            Ok(())
        }
    }
}
