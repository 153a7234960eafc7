//! Signet Node CLI
//!
//! Operator tooling for a federated signet:
//! - Inspect and validate round messages
//! - List round-scoped federation short ids
//! - Extract a signet solution from a finalized PSBT
//! - Finish a block template with a solution and proof of work

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::consensus::encode;
use bitcoin::Block;
use clap::{Parser, Subcommand};
use signet_core::block::{extract_solution, finish_block};
use signet_core::federation::{compute_short_id, distinct_signers, Decision, RoundValidator};
use signet_core::round::{PreFinalized, PsbtFinalizer};
use signet_core::{FederationConfig, RoundMessage};
use std::path::PathBuf;
use tracing::{info, Level};

/// Signet Node - federated signet operator tool
#[derive(Parser)]
#[command(name = "signet-node")]
#[command(about = "Federated 10-of-100 signet block signing tools")]
#[command(version = signet_core::VERSION)]
struct Cli {
    /// Federation configuration file (JSON)
    #[arg(short, long, env = "FEDERATION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a wire round message as JSON
    Decode {
        /// Hex encoded round message
        #[arg(short, long)]
        message: String,
    },

    /// List every member's short id for a round
    ShortIds {
        /// Round nonce
        #[arg(short, long)]
        nonce: u64,
    },

    /// Check a round message against the federation
    Validate {
        /// Hex encoded round message
        #[arg(short, long)]
        message: String,
    },

    /// Extract the signet solution from a finalized PSBT
    Solution {
        /// Finalized PSBT, base64 or hex
        #[arg(short, long)]
        psbt: String,
    },

    /// Embed the solution of a finalized PSBT into a template and grind it
    FinishBlock {
        /// Finalized PSBT, base64 or hex
        #[arg(short, long)]
        psbt: String,

        /// Hex encoded block template
        #[arg(short, long)]
        template: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decode { ref message } => {
            decode_message(message)?;
        }
        Commands::ShortIds { nonce } => {
            show_short_ids(&cli, nonce)?;
        }
        Commands::Validate { ref message } => {
            validate_message(&cli, message)?;
        }
        Commands::Solution { ref psbt } => {
            show_solution(psbt)?;
        }
        Commands::FinishBlock {
            ref psbt,
            ref template,
        } => {
            run_finish_block(psbt, template).await?;
        }
    }

    Ok(())
}

fn decode_message(message: &str) -> Result<()> {
    let msg = parse_message(message)?;

    let json = serde_json::json!({
        "message": msg,
        "distinct_signers": distinct_signers(&msg),
    });
    println!("{}", serde_json::to_string_pretty(&json)?);

    Ok(())
}

fn show_short_ids(cli: &Cli, nonce: u64) -> Result<()> {
    let config = load_config(cli)?;
    let local = config.local()?;

    println!("Short ids for nonce {}:", nonce);
    for key in config.keys()? {
        let marker = if local.as_ref() == Some(&key) { " (local)" } else { "" };
        println!(
            "  {:#018x}  {}{}",
            compute_short_id(nonce, &key),
            hex::encode(&key),
            marker
        );
    }

    Ok(())
}

fn validate_message(cli: &Cli, message: &str) -> Result<()> {
    let config = load_config(cli)?;
    let msg = parse_message(message)?;
    let federation = config.snapshot()?;

    let decision = RoundValidator::validate(&msg, Some(&federation));
    let signers = distinct_signers(&msg);

    info!(
        nonce = msg.nonce,
        signers,
        threshold = config.threshold,
        ?decision,
        "Validated round message"
    );

    match decision {
        Decision::Reject(reason) => println!("Rejected: {}", reason),
        Decision::AlreadyComplete => println!("Valid, already signed by local key"),
        Decision::Eligible => println!("Valid, eligible for signing"),
    }
    println!("  Signers: {}/{}", signers, config.threshold);

    Ok(())
}

fn show_solution(psbt: &str) -> Result<()> {
    let psbt = PreFinalized.finalize(&parse_bytes(psbt)?)?;
    let solution = extract_solution(&psbt)?;

    println!("{}", hex::encode(solution));

    Ok(())
}

async fn run_finish_block(psbt: &str, template: &str) -> Result<()> {
    let psbt = PreFinalized.finalize(&parse_bytes(psbt)?)?;
    let solution = extract_solution(&psbt)?;

    let template: Block = encode::deserialize(&hex::decode(template.trim())?)
        .context("block template is not a valid block")?;

    info!(
        txs = template.txdata.len(),
        solution_size = solution.len(),
        "Finishing block"
    );

    let block = tokio::task::spawn_blocking(move || finish_block(template, &solution)).await??;

    info!(
        hash = %block.block_hash(),
        nonce = block.header.nonce,
        "Block finished"
    );

    println!("{}", encode::serialize_hex(&block));

    Ok(())
}

fn load_config(cli: &Cli) -> Result<FederationConfig> {
    let path = cli
        .config
        .as_ref()
        .ok_or_else(|| anyhow!("no federation config, pass --config or set FEDERATION_CONFIG"))?;
    Ok(FederationConfig::load(path)?)
}

fn parse_message(message: &str) -> Result<RoundMessage> {
    let bytes = hex::decode(message.trim()).context("round message is not hex")?;
    Ok(RoundMessage::decode(&bytes)?)
}

/// Hex if it decodes as hex, base64 otherwise
fn parse_bytes(input: &str) -> Result<Vec<u8>> {
    let input = input.trim();
    if let Ok(bytes) = hex::decode(input) {
        return Ok(bytes);
    }
    STANDARD
        .decode(input)
        .map_err(|e| anyhow!("input is neither hex nor base64: {}", e))
}
