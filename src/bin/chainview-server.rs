#![forbid(unsafe_code)]
//! Line-oriented chainview server over stdin/stdout
//!
//! Each input line is one JSON command; each reply is one JSON line. Callback
//! messages are written as `{"bdvId": ..., "callback": ...}` lines. Lines
//! starting with `!` drive the built-in in-memory store:
//!
//! ```text
//! !block addr:value [addr:value ...]   mine a block paying the outputs
//! !zc addr:value [addr:value ...]      add a mempool transaction
//! ```

use chainview::callback::PushChannel;
use chainview::config::load_config;
use chainview::types::{ScrAddr, TxOut};
use chainview::{response_json, MemoryStore, RegistryHooks, SessionRegistry, ViewError};
use clap::Parser;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

struct StdoutChannel {
    bdv_id: String,
}

impl PushChannel for StdoutChannel {
    fn push(&self, payload: &str) -> Result<(), ViewError> {
        let message: serde_json::Value = serde_json::from_str(payload)?;
        let line = json!({ "bdvId": self.bdv_id, "callback": message });
        // A closed stdout means nobody is listening anymore
        writeln!(io::stdout().lock(), "{}", line).map_err(|_| ViewError::ChannelExpired)
    }
}

fn parse_outputs(fields: &[&str]) -> Result<Vec<TxOut>, String> {
    fields
        .iter()
        .map(|field| {
            let (addr, value) = field
                .split_once(':')
                .ok_or_else(|| format!("expected addr:value, got {}", field))?;
            let value = value
                .parse::<u64>()
                .map_err(|e| format!("bad value in {}: {}", field, e))?;
            Ok(TxOut {
                scr_addr: ScrAddr::from(addr),
                value,
            })
        })
        .collect()
}

fn run_store_command(store: &MemoryStore, line: &str) -> Result<serde_json::Value, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let outputs = parse_outputs(&parts.collect::<Vec<_>>())?;
    match verb {
        "!block" => {
            let tx = store.build_tx(outputs);
            Ok(json!({ "height": store.add_block(vec![tx]) }))
        }
        "!zc" => {
            let tx = store.build_tx(outputs);
            let hash = tx.hash.clone();
            Ok(json!({ "tx": hash, "sessions": store.add_zero_conf(tx) }))
        }
        other => Err(format!("unknown store command {}", other)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level: Level = config.server.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
    info!(
        "Starting chainview server (network_id = {})",
        config.server.network_id
    );

    let running = Arc::new(AtomicBool::new(true));
    let stop = Arc::clone(&running);
    let hooks = RegistryHooks {
        shutdown: Some(Box::new(move || stop.store(false, Ordering::SeqCst))),
        channel_factory: Some(Box::new(|bdv_id: &str| {
            Box::new(StdoutChannel {
                bdv_id: bdv_id.to_string(),
            }) as Box<dyn PushChannel>
        })),
    };

    let store = MemoryStore::new();
    let registry = SessionRegistry::new(Arc::new(store.clone()), &config, hooks)?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = if line.starts_with('!') {
            match run_store_command(&store, line) {
                Ok(value) => json!({ "result": value }),
                Err(message) => json!({ "error": { "kind": "store", "message": message } }),
            }
        } else {
            response_json(&registry.run_command(line))
        };
        println!("{}", reply);

        if !running.load(Ordering::SeqCst) {
            break;
        }
    }

    if running.load(Ordering::SeqCst) {
        warn!("input closed, shutting down");
    }
    registry.shutdown();
    info!("chainview server stopped");
    Ok(())
}
