//! Launchpad service — entry point.
//!
//! Wires the record store, the funding-opening orchestrator and its external
//! collaborators (pinning service, deployment gateway, wallet signer) behind
//! an Axum REST API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post, put},
    Router,
};
use reqwest::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use launchpad::api::{self, AppState};
use launchpad::config::Config;
use launchpad::db;
use launchpad::orchestrator::{FundingOpener, OpenerSettings};
use launchpad::publisher::{MemoryPublisher, PinningPublisher, SnapshotPublisher};
use launchpad::rpc::RpcLedger;
use launchpad::saga::SagaStore;
use launchpad::signer::{RemoteSigner, WalletSigner};
use launchpad::store::RecordStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;
    let store = RecordStore::new(pool.clone());
    let sagas = SagaStore::new(pool);

    // HTTP client shared by every outbound adapter.
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

    // ─── Signer ───────────────────────────────────────────
    let signer = Arc::new(RemoteSigner::new(
        client.clone(),
        &config.signer_url,
        &config.signer_address,
    ));
    match signer.sign_message(b"launchpad startup check").await {
        Ok(_) => info!(address = %signer.address(), "Wallet signer reachable"),
        Err(e) => warn!(address = %signer.address(), "Wallet signer check failed: {e}"),
    }

    // ─── Ledger & publisher ───────────────────────────────
    let ledger = Arc::new(RpcLedger::new(
        client.clone(),
        config.ledger_rpc_url.clone(),
        config.factory_address.clone(),
        signer,
    ));

    let publisher: Arc<dyn SnapshotPublisher> = match &config.pinning_api_url {
        Some(url) => Arc::new(PinningPublisher::new(
            client,
            url.clone(),
            config.pinning_jwt.clone(),
            config.ipfs_gateway_host.clone(),
        )),
        None => {
            warn!("PINNING_API_URL not set; snapshots are kept in memory only");
            Arc::new(MemoryPublisher::new(config.ipfs_gateway_host.clone()))
        }
    };

    let opener = FundingOpener::new(
        store.clone(),
        sagas,
        publisher,
        ledger.clone(),
        ledger.clone(),
        OpenerSettings {
            chain_id: config.chain_id,
            factory_address: config.factory_address.clone(),
            defaults: config.defaults.clone(),
            timeouts: config.timeouts,
        },
    );

    // ─── REST API ─────────────────────────────────────────
    let state = Arc::new(AppState {
        store,
        opener,
        tokens: ledger,
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/creator/overview", get(api::creator_overview))
        .route("/projects", post(api::create_project).get(api::list_projects))
        .route(
            "/projects/:id",
            get(api::get_project)
                .patch(api::update_project)
                .delete(api::delete_project),
        )
        .route("/projects/:id/commitments", put(api::replace_commitments))
        .route("/projects/:id/validate-open", post(api::validate_open))
        .route("/projects/:id/manifest", get(api::get_manifest))
        .route("/projects/:id/open-funding", post(api::open_funding))
        .route("/projects/:id/events", get(api::get_project_events))
        .route("/tokens/:address", get(api::get_token))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // ─── Shutdown ─────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        trigger.cancel();
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Shut down cleanly");
    Ok(())
}
