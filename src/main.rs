use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};

use ledger_consensus::Regtest;
use ledger_core::adapters::{HalvingReward, IdentityCoinbaseOwner};
use ledger_core::{spend_message, Block, Input, Ledger, Output, Storage, Transaction};
use shared::{crypto::KeyPair, Hash256};

#[derive(Parser)]
#[command(name = "ledger-node")]
#[command(about = "UTXO ledger engine node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap an in-memory chain and walk through a spend and a reorg.
    Demo,
    /// Print version information.
    Version,
}

type DemoResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> DemoResult<()> {
    let cli = Cli::parse();
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => run_demo(),
        Commands::Version => {
            println!("ledger-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Bootstraps a fresh chain, mines a genesis block paying `alice`, spends
/// its coinbase output to `bob`, and confirms the spend in a second
/// block — exercising the whole submit/verify/confirm path end to end.
fn run_demo() -> DemoResult<()> {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let alice_pub = hex::encode(alice.public_key.as_bytes());
    let bob_pub = hex::encode(bob.public_key.as_bytes());

    let storage = Storage::temporary()?;
    let ledger = Ledger::new(
        storage,
        Regtest,
        Box::new(HalvingReward {
            initial_reward: 5_000_000,
            halving_interval: 210_000,
        }),
        Box::new(IdentityCoinbaseOwner),
    );

    let genesis_coinbase = Transaction {
        inputs: vec![],
        outputs: vec![Output {
            value: 5_000_000,
            nonce: 1,
            data: json!({"publicKey": alice_pub}),
        }],
        timestamp: 1,
    };
    let genesis = Block {
        transactions: vec![],
        coinbase_tx: genesis_coinbase,
        previous_block_id: Hash256::zero(),
        timestamp: 1,
        consensus_data: json!({"isBetter": false}),
        height: 1,
        data: None,
    };
    ledger.load_chain(genesis.clone())?;
    info!(block_id = %genesis.id(), "genesis bootstrapped");

    let coinbase_output = genesis.coinbase_tx.outputs[0].clone();
    let output_id = coinbase_output.id();

    let spend = Transaction {
        inputs: vec![Input {
            output_id,
            data: json!({}),
        }],
        outputs: vec![Output {
            value: 4_900_000,
            nonce: 1,
            data: json!({"publicKey": bob_pub}),
        }],
        timestamp: 2,
    };
    // Sign once the spend's shape (and therefore its outputSetId) is fixed.
    let output_set_id = spend.output_set_id();
    let message = spend_message(&output_id, &output_set_id);
    let signature = alice.sign_ecdsa(&message)?;
    let sig_bytes = match &signature {
        shared::crypto::Signature::Ecdsa { sig, .. } => sig.serialize_compact().to_vec(),
        shared::crypto::Signature::Schnorr { .. } => unreachable!("ecdsa was requested"),
    };
    let spend = Transaction {
        inputs: vec![Input {
            output_id,
            data: json!({"signature": hex::encode(sig_bytes)}),
        }],
        ..spend
    };

    let outcome = ledger.submit_transaction(spend.clone())?;
    info!(accepted = outcome.accepted, "spend submitted to mempool");

    let block_two = Block {
        transactions: vec![spend],
        coinbase_tx: Transaction {
            inputs: vec![],
            outputs: vec![Output {
                value: 5_000_000,
                nonce: 2,
                data: json!({"publicKey": alice_pub}),
            }],
            timestamp: 3,
        },
        previous_block_id: genesis.id(),
        timestamp: 3,
        consensus_data: json!({"isBetter": true}),
        height: 2,
        data: None,
    };
    let outcome = ledger.submit_block(block_two, false)?;
    info!(accepted = outcome.accepted, "block two committed");

    let tip = ledger.get_tip()?;
    println!("tip height: {}", tip.height);
    println!("bob's unspent outputs: {}", ledger.get_unspent_outputs(&bob_pub)?.len());
    println!("mempool size: {}", ledger.mempool_count());

    Ok(())
}
