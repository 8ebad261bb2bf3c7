use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod formatters;

use commands::simulate::SimulateArgs;
use formatters::FormatMode;

#[derive(Parser)]
#[command(name = "pos")]
#[command(about = "Payment terminal tools - TLV decoding, card brands, PIN blocks and a simulated reader")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a BER-TLV hex string
    Tlv {
        hex: String,

        /// Print only the first object with this tag (hex)
        #[arg(short, long)]
        search: Option<String>,

        /// Output format mode
        #[arg(short, long, value_enum, default_value_t = FormatMode::Human)]
        format: FormatMode,
    },

    /// Decode a Data Object List (tag and length pairs)
    Dol { hex: String },

    /// Identify the card brand of a PAN and check its Luhn digit
    Brand { pan: String },

    /// Build an ISO 9564 format 4 (AES) PIN block
    PinBlock {
        #[arg(long)]
        pan: String,

        /// AES key as hex (16, 24 or 32 bytes)
        #[arg(long)]
        key: String,

        #[arg(long)]
        pin: String,

        /// 16 bytes of random fill as hex; generated when omitted
        #[arg(long)]
        random: Option<String>,
    },

    /// Run a transaction against the simulated reader
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() {
    // Set RUST_LOG=debug for detailed logs
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Tlv {
            hex,
            search,
            format,
        } => commands::tlv::cmd_tlv(&hex, search.as_deref(), format),
        Command::Dol { hex } => commands::tlv::cmd_dol(&hex),
        Command::Brand { pan } => commands::brand::cmd_brand(&pan),
        Command::PinBlock {
            pan,
            key,
            pin,
            random,
        } => commands::pin_block::cmd_pin_block(&pan, &key, &pin, random.as_deref()),
        Command::Simulate(args) => commands::simulate::cmd_simulate(args).await,
    }
}
