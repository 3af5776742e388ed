//! # ailink
//!
//! OpenAI-compatible API bridge for socket-connected AI devices.
//!
//! Devices hold a persistent WebSocket to this server and execute chat and
//! speech commands on-device. HTTP callers speak the OpenAI API; the bridge
//! translates each call into an asynchronous device command and routes the
//! device's reply back to the HTTP response still waiting for it. Remote MCP
//! tool servers can be attached per device and are offered to the device's
//! model through a prompt preamble.
//!
//! ## API surface
//!
//! | Method | Path                                   | Auth | Description                       |
//! |--------|----------------------------------------|------|-----------------------------------|
//! | GET    | `/health`                              | No   | Liveness probe                    |
//! | GET    | `/ws?device_id=<id>`                   | No*  | Device WebSocket registration     |
//! | POST   | `/{device}/v1/chat/completions`        | PIN  | OpenAI chat completion            |
//! | GET    | `/{device}/v1/models`                  | PIN  | Static model listing              |
//! | POST   | `/{device}/v1/audio/speech`            | PIN  | OpenAI text-to-speech             |
//! | POST   | `/{device}/enable-pin`                 | PIN  | Set a 6-digit PIN                 |
//! | POST   | `/{device}/disable-pin`                | PIN  | Remove the PIN                    |
//! | POST   | `/{device}/change-pin`                 | PIN  | Replace the PIN                   |
//! | GET    | `/{device}/info` / `/{device}/status`  | PIN  | Record / live status              |
//! | POST   | `/{device}/sync`                       | PIN  | Refresh the device record         |
//! | *      | `/{device}/mcp/...`                    | PIN  | MCP server management             |
//! | GET    | `/mcp/templates`                       | No   | Static MCP server presets         |
//!
//! "PIN" means `Authorization: Bearer <pin>` when the device has one set;
//! devices without a PIN accept unauthenticated calls.
//! *The device socket validates the id format; credentials for the socket
//! itself are a deployment concern.
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, background loops, shutdown
//! state.rs       — shared AppState
//! auth.rs        — PIN parsing, digests, constant-time comparison
//! config.rs      — TOML + env-var configuration
//! error.rs       — error taxonomy → OpenAI error envelope
//! registry.rs    — device socket sessions + PIN credential store
//! broker.rs      — pending table, admission, dispatch, resolve, timeout
//! history.rs     — per-device rolling conversation window
//! protocol.rs    — OpenAI-surface types and socket payloads
//! routes/        — REST handlers (openai, device, mcp) + router assembly
//! ws/            — device WebSocket upgrade and message dispatch
//! mcp/           — tool-server manager, JSON-RPC client, approval policy
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use ailink::{AppState, Config};

/// OpenAI-compatible API bridge for socket-connected AI devices.
#[derive(Parser)]
#[command(name = "ailink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("ailink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let state = AppState::new(config);
    let app = ailink::routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: evict devices with stale heartbeats and drain their
    // pending requests so HTTP callers are not left waiting.
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            sweep_state.config.server.sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            let evicted = sweep_state
                .registry
                .sweep_stale(sweep_state.config.server.heartbeat_timeout_secs)
                .await;
            for device_id in evicted {
                sweep_state.broker.fail_device(&device_id).await;
            }
        }
    });

    // MCP maintenance: health pings and due reconnects. Runs on a short
    // cadence; the manager decides per-server what is due.
    let mcp = state.mcp.clone();
    let mcp_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            mcp.tick(std::time::Instant::now()).await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    mcp_task.abort();
    state.mcp.shutdown().await;
    info!("Goodbye");
}
