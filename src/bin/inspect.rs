//! Wallet inspection tool
//!
//! Offline helpers for looking at the data an account works with.
//!
//! ## Usage
//! ```bash
//! # First receive addresses of an account xpub
//! cargo run --bin wallet-inspect --features cli -- derive \
//!     --xpub tpubD... --keypath "m/84'/1'/0'" --script-type p2wpkh --network testnet
//!
//! # Change addresses, as JSON
//! cargo run --bin wallet-inspect --features cli -- derive --xpub tpubD... --change --format json
//!
//! # Contents of an account database
//! cargo run --bin wallet-inspect --features cli -- dump-db --path account-<hash>-tbtc.db
//!
//! # Tip of a headers file
//! cargo run --bin wallet-inspect --features cli -- headers --path headers-testnet.bin -v
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpub};
use bitcoin::Network;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, Level};

use lightweight_btc_wallet::{
    addresses::AddressChain,
    data_structures::{ScriptHashHex, ScriptType},
    storage::{HeadersDb, TransactionsDb},
    transactions::UNKNOWN_ADDRESS,
    WalletError, WalletResult,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Increase log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Derive addresses from an account xpub
    Derive {
        #[arg(long)]
        xpub: String,
        #[arg(long, default_value = "m/84'/0'/0'", help = "Absolute keypath of the xpub")]
        keypath: String,
        #[arg(long, default_value = "p2wpkh", help = "p2pkh, p2wpkh-p2sh, p2wpkh or p2tr")]
        script_type: String,
        #[arg(long, default_value = "bitcoin")]
        network: String,
        #[arg(long, default_value = "20", help = "Number of addresses to derive")]
        count: u16,
        #[arg(long, help = "Derive from the change chain")]
        change: bool,
    },
    /// Print the contents of an account transactions database
    DumpDb {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "bitcoin")]
        network: String,
    },
    /// Print the tip of a headers file
    Headers {
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct DerivedAddress {
    index: u32,
    keypath: String,
    address: String,
    script_hash: ScriptHashHex,
}

#[derive(Serialize)]
struct DumpedTransaction {
    txid: String,
    height: i32,
    verified: bool,
    header_timestamp: Option<String>,
    created_timestamp: Option<String>,
}

#[derive(Serialize)]
struct DumpedOutput {
    outpoint: String,
    value: u64,
    address: String,
    spent_by: Option<String>,
}

#[derive(Serialize)]
struct DbDump {
    gap_limits: (u16, u16),
    transactions: Vec<DumpedTransaction>,
    outputs: Vec<DumpedOutput>,
}

#[derive(Serialize)]
struct HeadersSummary {
    tip: i32,
    tip_hash: Option<String>,
    tip_time: Option<u32>,
}

fn parse_network(network: &str) -> WalletResult<Network> {
    Network::from_str(network)
        .map_err(|e| WalletError::invalid_argument("network", e.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> WalletResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn derive(
    xpub: &str,
    keypath: &str,
    script_type: &str,
    network: &str,
    count: u16,
    change: bool,
) -> WalletResult<Vec<DerivedAddress>> {
    let xpub =
        Xpub::from_str(xpub).map_err(|e| WalletError::invalid_argument("xpub", e.to_string()))?;
    let keypath = DerivationPath::from_str(keypath)
        .map_err(|e| WalletError::invalid_argument("keypath", e.to_string()))?;
    let script_type = ScriptType::from_str(script_type)?;
    let mut chain = AddressChain::new(
        xpub,
        keypath,
        script_type,
        parse_network(network)?,
        count,
        change,
    );
    Ok(chain
        .ensure_addresses()?
        .into_iter()
        .map(|address| DerivedAddress {
            index: address.derivation.address_index,
            keypath: address.keypath.to_string(),
            address: address.encode(),
            script_hash: address.script_hash().clone(),
        })
        .collect())
}

fn dump_db(path: &Path, network: &str) -> WalletResult<DbDump> {
    if !path.exists() {
        return Err(WalletError::ResourceNotFound(path.display().to_string()));
    }
    let network = parse_network(network)?;
    let db = TransactionsDb::open(path)?;
    let db_tx = db.begin_read()?;
    let limits = db_tx.gap_limits()?;

    let mut transactions = Vec::new();
    for txid in db_tx.transactions()? {
        let info = db_tx.tx_info(&txid)?;
        transactions.push(DumpedTransaction {
            txid: txid.to_string(),
            height: info.height,
            verified: info.is_verified(),
            header_timestamp: info.header_timestamp.map(|ts| ts.to_rfc3339()),
            created_timestamp: info.created_timestamp.map(|ts| ts.to_rfc3339()),
        });
    }

    let mut outputs = Vec::new();
    for (outpoint, txout) in db_tx.outputs()? {
        outputs.push(DumpedOutput {
            outpoint: outpoint.to_string(),
            value: txout.value.to_sat(),
            address: bitcoin::Address::from_script(&txout.script_pubkey, network)
                .map(|address| address.to_string())
                .unwrap_or_else(|_| UNKNOWN_ADDRESS.to_string()),
            spent_by: db_tx.input(&outpoint)?.map(|txid| txid.to_string()),
        });
    }
    outputs.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
    debug!(
        transactions = transactions.len(),
        outputs = outputs.len(),
        "database loaded"
    );
    Ok(DbDump {
        gap_limits: (limits.receive, limits.change),
        transactions,
        outputs,
    })
}

fn headers_summary(path: &Path) -> WalletResult<HeadersSummary> {
    if !path.exists() {
        return Err(WalletError::ResourceNotFound(path.display().to_string()));
    }
    let db = HeadersDb::open(path)?;
    let tip = db.tip();
    let header = db.header_by_height(tip)?;
    Ok(HeadersSummary {
        tip,
        tip_hash: header.map(|header| header.block_hash().to_string()),
        tip_time: header.map(|header| header.time),
    })
}

fn main() -> WalletResult<()> {
    let args = CliArgs::parse();
    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let json = args.format == OutputFormat::Json;
    match args.command {
        Command::Derive {
            xpub,
            keypath,
            script_type,
            network,
            count,
            change,
        } => {
            let addresses = derive(&xpub, &keypath, &script_type, &network, count, change)?;
            if json {
                return print_json(&addresses);
            }
            for address in addresses {
                println!(
                    "{:>4}  {:<24}  {}  {}",
                    address.index, address.keypath, address.address, address.script_hash
                );
            }
        }
        Command::DumpDb { path, network } => {
            let dump = dump_db(&path, &network)?;
            if json {
                return print_json(&dump);
            }
            println!(
                "gap limits: receive {}, change {}",
                dump.gap_limits.0, dump.gap_limits.1
            );
            println!("transactions ({}):", dump.transactions.len());
            for tx in &dump.transactions {
                println!(
                    "  {}  height {:>8}  {}",
                    tx.txid,
                    tx.height,
                    if tx.verified { "verified" } else { "unverified" }
                );
            }
            println!("outputs ({}):", dump.outputs.len());
            for output in &dump.outputs {
                println!(
                    "  {}  {:>14} sat  {}  {}",
                    output.outpoint,
                    output.value,
                    output.address,
                    output
                        .spent_by
                        .as_deref()
                        .map(|txid| format!("spent by {txid}"))
                        .unwrap_or_else(|| "unspent".to_string())
                );
            }
        }
        Command::Headers { path } => {
            let summary = headers_summary(&path)?;
            if json {
                return print_json(&summary);
            }
            match summary.tip_hash {
                Some(hash) => println!("tip {} ({hash})", summary.tip),
                None => println!("no headers stored"),
            }
        }
    }
    Ok(())
}
