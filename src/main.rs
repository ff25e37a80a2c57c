use huddle::{
    api::RestClient, bus::EventBus, config::Config, interface::terminal::TerminalInterface,
    session::ChatSession, store::ConversationStore, transport,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the filter reads RUST_LOG
    let dotenv = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenv {
        // Not fatal; the environment may already be set
        info!("No .env file found or failed to load: {}", e);
    }

    let config = Config::from_env()?;
    info!(user = %config.user_id, "huddle starting...");

    let bus = Arc::new(EventBus::new());
    let store = ConversationStore::new(bus.clone());
    let rest = Arc::new(RestClient::new(&config)?);

    info!("Connecting to realtime endpoint at {}", config.socket_url);
    let socket = transport::shared(&config.socket_url).await?;

    let session = ChatSession::new(config.identity(), socket, rest.clone(), store)
        .with_ack_timeout(config.ack_timeout);
    let terminal = TerminalInterface::new(session, rest, bus);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = terminal.run() => {
            if let Err(e) = res {
                error!("Terminal stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
