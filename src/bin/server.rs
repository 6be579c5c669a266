//! Chatcast server
//!
//! Run with: chatcast-server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatcast::error::Result;
use chatcast::realtime::{BroadcastService, ChatServer, ConnectionRegistry};
use chatcast::storage::Storage;
use chatcast::types::{ServerConfig, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "chatcast-server")]
#[command(about = "Chat server pushing messages to browsers over Server-Sent Events")]
struct Args {
    /// Database path
    #[arg(
        long,
        env = "CHATCAST_DB_PATH",
        default_value = "~/.local/share/chatcast/chats.db"
    )]
    db_path: String,

    /// Address to listen on
    #[arg(long, env = "CHATCAST_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Seconds before an SSE connection is closed (clients reconnect automatically)
    #[arg(long, env = "CHATCAST_CONNECTION_TIMEOUT", default_value = "60")]
    connection_timeout_seconds: u64,

    /// Events buffered per connection before the client counts as unreachable
    #[arg(long, env = "CHATCAST_CHANNEL_CAPACITY", default_value = "64")]
    channel_capacity: usize,

    /// Emit logs as JSON
    #[arg(long, env = "CHATCAST_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    // Expand ~ in path
    let db_path = shellexpand::tilde(&args.db_path).to_string();

    let storage = Storage::open(StorageConfig { db_path })?;
    tracing::info!(
        db_path = %storage.config().db_path,
        chats = storage.chat_count()?,
        "Storage opened"
    );

    let config = ServerConfig {
        bind_addr: args.bind,
        connection_timeout: Duration::from_secs(args.connection_timeout_seconds),
        channel_capacity: args.channel_capacity,
    };
    config.validate()?;

    let service = BroadcastService::new(Arc::new(storage), ConnectionRegistry::new());
    ChatServer::new(service, config).start().await
}
