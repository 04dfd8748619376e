//! Keyward administration tool.
//!
//! Inspects and edits a redb key database offline.
//!
//! # Usage
//!
//! ```bash
//! # Device and cross-signing keys of a user, as JSON
//! keyward-admin --db keys.redb --server-name example.org query @alice:example.org
//!
//! # Unclaimed one-time keys of a device
//! keyward-admin --db keys.redb --server-name example.org counts @alice:example.org PHONE
//!
//! # Remove a device with all of its keys
//! keyward-admin --db keys.redb --server-name example.org delete-device @alice:example.org PHONE
//! ```

use std::{collections::BTreeMap, io::Write, path::PathBuf};

use clap::{Parser, Subcommand};
use keyward_proto::UserId;
use keyward_server::{E2eKeys, EngineConfig, NoFederation, RedbStorage};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keyward key database administration
#[derive(Parser, Debug)]
#[command(name = "keyward-admin")]
#[command(about = "Inspect and edit a keyward key database")]
#[command(version)]
struct Args {
    /// Path to the redb database
    #[arg(long)]
    db: PathBuf,

    /// Name of the server owning the database
    #[arg(long, default_value = keyward_server::config::DEFAULT_SERVER_NAME)]
    server_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print device keys and cross-signing keys of a user
    Query {
        /// User to query
        user: UserId,
        /// Devices to include; all when omitted
        devices: Vec<String>,
    },

    /// Print unclaimed one-time key counts of a device
    Counts {
        /// Owner of the device
        user: UserId,
        /// Device id
        device: String,
    },

    /// Delete a device with its identity keys and one-time keys
    DeleteDevice {
        /// Owner of the device
        user: UserId,
        /// Device id
        device: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    let storage = RedbStorage::open(&args.db)?;
    let engine = E2eKeys::new(storage, NoFederation, EngineConfig::new(args.server_name));
    tracing::debug!(db = %args.db.display(), "opened key database");

    match args.command {
        Command::Query { user, devices } => {
            let query = keyward_proto::QueryKeysRequest {
                device_keys: BTreeMap::from([(user, devices)]),
            };
            let answer = engine.on_federation_query_client_keys(&query)?;
            write_json(&answer)?;
        },
        Command::Counts { user, device } => {
            let counts = engine.one_time_key_counts(&user, &device)?;
            write_json(&counts)?;
        },
        Command::DeleteDevice { user, device } => {
            let deleted = engine.delete_device(&user, &device)?;
            write_json(&json!({ "deleted": deleted }))?;
        },
    }

    Ok(())
}

fn write_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
