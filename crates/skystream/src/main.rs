//! Skystream: AT Protocol relay event-stream subscriber
//!
//! Main binary with subcommands:
//! - `subscribe`: follow a relay, resuming from a persisted cursor
//! - `decode`: decode and classify one captured frame

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

mod cursor_file;
mod decode;
mod subscribe;

use cursor_file::CursorFile;

#[derive(Parser)]
#[command(name = "skystream")]
#[command(about = "AT Protocol relay event-stream subscriber", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a relay's repository event stream
    Subscribe {
        /// Relay WebSocket URL (an http(s) host URL is converted)
        #[arg(long, env = "SKYSTREAM_RELAY_URL", default_value = skystream_firehose::DEFAULT_RELAY_URL)]
        relay: String,

        /// Resume after this sequence number (overrides the cursor file)
        #[arg(long)]
        cursor: Option<i64>,

        /// File the cursor is loaded from and saved to
        #[arg(long, env = "SKYSTREAM_CURSOR_FILE")]
        cursor_file: Option<PathBuf>,

        /// Consecutive reconnection attempts before giving up
        #[arg(long, env = "SKYSTREAM_RETRY_BUDGET", default_value = "10")]
        retry_budget: u32,

        /// Stop instead of reconnecting when the connection drops
        #[arg(long)]
        no_auto_reconnect: bool,

        /// Print events as JSON lines on stdout.
        /// Accepts 1/true/yes/on or 0/false/no/off (case-insensitive).
        #[arg(long, env = "SKYSTREAM_JSON", value_parser = parse_bool_env, default_value = "false")]
        json: bool,

        /// Save the cursor every N events (and always on exit)
        #[arg(long, default_value = "100")]
        save_every: u64,

        /// List relay repositories over HTTP when the cursor predates the
        /// relay's retained history
        #[arg(long)]
        backfill: bool,

        /// Bearer token for backfill requests
        #[arg(long, env = "SKYSTREAM_ACCESS_TOKEN")]
        access_token: Option<String>,
    },

    /// Decode and classify a single frame
    Decode {
        /// File containing the raw binary frame
        #[arg(long, conflicts_with = "base64", required_unless_present = "base64")]
        file: Option<PathBuf>,

        /// Base64-encoded frame
        #[arg(long)]
        base64: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for JSON output
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "skystream=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Subscribe {
            relay,
            cursor,
            cursor_file,
            retry_budget,
            no_auto_reconnect,
            json,
            save_every,
            backfill,
            access_token,
        } => {
            subscribe::run(subscribe::SubscribeOptions {
                relay_url: relay,
                cursor,
                cursor_file: CursorFile::new(cursor_file.unwrap_or_else(CursorFile::default_path)),
                retry_budget,
                auto_reconnect: !no_auto_reconnect,
                json,
                save_every: save_every.max(1),
                backfill,
                access_token,
            })
            .await
        }

        Commands::Decode { file, base64 } => decode::run(file.as_deref(), base64.as_deref()).await,
    }
}
