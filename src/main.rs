//! # perpdesk — multi-account derivatives backend
//!
//! ## Environment Variables
//!
//! | Variable                     | Default          | Description                          |
//! |------------------------------|------------------|--------------------------------------|
//! | `BIND_ADDR`                  | `0.0.0.0:3000`   | Address Axum listens on              |
//! | `ACCOUNTS_FILE`              | —                | JSON array seeding the registry      |
//! | `TICKER_REFRESH_MS` etc.     | see `config.rs`  | Per-domain refresh cadence           |
//! | `STREAM_RECONNECT_*`         | see `config.rs`  | Push-channel reconnect backoff       |
//! | `BYBIT_*_URL`, `BINANCE_*_URL` | mainnet        | Exchange endpoints                   |
//! | `RUST_LOG`                   | `perpdesk=debug` | Tracing filter                       |

use std::net::SocketAddr;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use perpdesk::{config::AppConfig, registry::AccountRegistry, routes, state::build_state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("perpdesk=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║            PERPDESK — Derivatives Backend             ║
  ║   Adapters · Push Channels · Caches · DCA Ladders     ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Shared state + background tasks ────────────────────────────────────
    let config = AppConfig::from_env();
    let addr: SocketAddr = config.bind_addr.parse()?;
    let state = build_state(config).await?;
    let _background = state.spawn_background();

    // ── 4. Track seeded accounts ──────────────────────────────────────────────
    for account in state.registry.get_all_accounts().await? {
        match state.start_tracking_account(account.id).await {
            Ok(()) => info!(account_id = %account.id, name = %account.name, "✅ Seeded account tracked"),
            Err(err) => warn!(account_id = %account.id, error = %err, "⚠️ Seeded account not tracked"),
        }
    }

    // ── 5. CORS ───────────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // ── 6. Router ─────────────────────────────────────────────────────────────
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // ── 7. Bind & Serve ───────────────────────────────────────────────────────
    info!(?addr, "🚀 Perpdesk server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
