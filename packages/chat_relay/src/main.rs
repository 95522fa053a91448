use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use gateway_client::GatewayClient;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod error;
mod handlers;
mod metrics;
mod relay;
#[cfg(test)]
mod test_helpers;

use crate::config::{DEFAULT_HOST, DEFAULT_PORT, Profile, RelayConfig, RelayDirs};
use crate::metrics::RelayMetrics;
use crate::relay::{ChatTurn, TurnOutcome};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Streams agent gateway chat runs to browsers as server-sent events")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.chat-relay)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP relay in the foreground (default)
    Serve(ServeArgs),

    /// Send one message through the gateway and print the event stream
    Ask(AskArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Configuration preset
    #[arg(long, value_enum)]
    profile: Option<Profile>,
}

#[derive(Parser)]
struct AskArgs {
    /// Message to send
    message: String,

    /// Session to post into (defaults to the configured session)
    #[arg(short, long)]
    session: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub gateway: GatewayClient,
    /// Relay runtime configuration
    pub relay_config: Arc<RelayConfig>,
    /// Relay metrics for observability
    pub metrics: Arc<RelayMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let dirs = RelayDirs::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_server(ServeArgs::default(), dirs).await,
        Some(Commands::Serve(args)) => run_server(args, dirs).await,
        Some(Commands::Ask(args)) => ask_command(args, dirs).await,
    }
}

impl Cli {
    fn debug(&self) -> bool {
        match &self.command {
            None => false,
            Some(Commands::Serve(args)) => args.debug,
            Some(Commands::Ask(args)) => args.debug,
        }
    }

    /// `ask` keeps stdout for the event stream.
    fn logs_to_stderr(&self) -> bool {
        matches!(self.command, Some(Commands::Ask(_)))
    }
}

/// Installed before anything else runs so startup lines are not lost.
fn init_tracing(cli: &Cli) {
    let registry = tracing_subscriber::registry().with(env_filter(cli.debug()));
    if cli.logs_to_stderr() {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    let default_directive = if debug {
        "relay=debug,gateway_client=debug,tower_http=debug,info"
    } else {
        "relay=info,gateway_client=info,tower_http=info,warn"
    };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive))
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Chat routes
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/chat/history", get(handlers::chat_history_handler))
        .route("/api/chat/abort", post(handlers::chat_abort_handler))
        .route("/api/chat/inject", post(handlers::chat_inject_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServeArgs, dirs: RelayDirs) -> Result<()> {
    info!("Starting chat relay");

    let file_config = dirs.load(args.profile.as_ref())?;
    let gateway_config = file_config.gateway.to_gateway_config();
    info!(
        "Gateway: {} (connect timeout {}ms, request timeout {}ms)",
        gateway_config.url,
        gateway_config.connect_timeout.as_millis(),
        gateway_config.request_timeout.as_millis()
    );

    let gateway = GatewayClient::spawn(gateway_config);

    // Connect eagerly so the first chat does not pay for the handshake.
    // A failure here only logs; the client keeps reconnecting with backoff.
    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            match gateway.ensure_connected().await {
                Ok(()) => info!("Gateway connected"),
                Err(e) => warn!(
                    error = %e,
                    "Initial gateway connection failed, retrying in background"
                ),
            }
        });
    }

    let relay_config = Arc::new(RelayConfig::from_file(&file_config.relay));
    info!(
        "Relay config: default_session={}, keep_alive={}s, channel_capacity={}",
        relay_config.default_session_key,
        relay_config.keep_alive.as_secs(),
        relay_config.channel_capacity
    );

    let app_state = AppState {
        gateway: gateway.clone(),
        relay_config,
        metrics: Arc::new(RelayMetrics::new()),
    };
    let app = build_router(app_state);

    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Chat relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/chat            - Send a message, stream the reply (SSE)");
    info!("  GET    /api/chat/history    - Session transcript");
    info!("  POST   /api/chat/abort      - Stop a running reply");
    info!("  POST   /api/chat/inject     - Append a message without a reply");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Closing gateway connection...");
    gateway.destroy().await;

    info!("Shutdown complete");
    server_result
}

async fn ask_command(args: AskArgs, dirs: RelayDirs) -> Result<()> {
    let file_config = dirs.load(None)?;
    let relay_config = RelayConfig::from_file(&file_config.relay);
    let turn = ChatTurn::new(relay_config.session_key(args.session), args.message);
    turn.validate()?;

    let gateway = GatewayClient::spawn(file_config.gateway.to_gateway_config());
    let (tx, mut rx) = mpsc::channel(relay_config.channel_capacity);

    let turn_task = {
        let gateway = gateway.clone();
        tokio::spawn(async move { relay::run_turn(&gateway, turn, tx).await })
    };

    while let Some(event) = rx.recv().await {
        println!("event: {}", event.name());
        println!("data: {}", event.payload());
        println!();
    }

    let outcome = turn_task.await.context("Chat turn task failed")?;
    gateway.destroy().await;

    match outcome {
        TurnOutcome::StartFailed => anyhow::bail!("Could not start a chat run"),
        outcome => {
            info!(?outcome, "Chat turn finished");
            Ok(())
        }
    }
}
