//! ORPflow HFT - Order Book Sync Service
//!
//! Connects to Binance depth streams, keeps every configured book in sync
//! through the snapshot/diff engine, and publishes book changes to other
//! system components.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use book_sync::{
    telemetry, AssetClass, BinanceSnapshotFetcher, Book, Config, Key, Manager, Publisher,
    WebSocketManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    info!("Starting ORPflow order book sync");

    let config = Arc::new(Config::load()?);
    info!(keys = ?config.keys, "Configuration loaded");

    let fetcher = Arc::new(BinanceSnapshotFetcher::new(config.clone())?);
    let books = Manager::start(config.sync.clone(), fetcher);
    for key in &config.keys {
        books.subscribe(*key);
    }

    // Forward book changes over IPC
    let publisher = Publisher::new(&config.ipc_socket_path).await;
    let updates = books.subscribe_updates();
    tokio::spawn(async move { publisher.run(updates).await });

    let health_books = books.clone();
    let port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_books, port).await {
            warn!(error = %e, "Health server error");
        }
    });

    let status_logger = spawn_status_logger(books.clone(), config.health_check_interval_secs);

    // One stream per market
    let assets: BTreeSet<AssetClass> = config.keys.iter().map(|key| key.asset).collect();
    let streams: Vec<JoinHandle<()>> = assets
        .into_iter()
        .map(|asset| {
            let mut ws = WebSocketManager::new(books.clone(), config.clone(), asset);
            tokio::spawn(async move {
                if let Err(e) = ws.run().await {
                    error!(asset = %asset, error = %e, "WebSocket manager failed");
                }
            })
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    books.shutdown().await;
    status_logger.abort();
    for stream in streams {
        stream.abort();
    }

    Ok(())
}

/// Periodically log the derived metrics of every synchronized book
fn spawn_status_logger(books: Manager, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            for key in books.keys() {
                let Some(book) = books.get_book(&key) else {
                    continue;
                };
                if let Some(mid) = book.metrics.mid_price {
                    info!(
                        key = %key,
                        mid_price = %mid,
                        spread_bps = ?book.metrics.spread_bps,
                        imbalance = ?book.metrics.imbalance,
                        seq = book.last_update_seq,
                        "Order book status"
                    );
                } else {
                    info!(key = %key, status = ?books.status(&key), "Order book not synchronized");
                }
            }
        }
    })
}

/// Start HTTP server for health checks, metrics and book reads
async fn start_health_server(books: Manager, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/books/:key", get(get_book))
        .layer(TraceLayer::new_for_http())
        .with_state(books);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(books): State<Manager>) -> Json<serde_json::Value> {
    let keys: serde_json::Map<String, serde_json::Value> = books
        .keys()
        .into_iter()
        .filter_map(|key| {
            let status = books.status(&key)?;
            Some((key.to_string(), serde_json::json!(status)))
        })
        .collect();
    let synced = keys.values().filter(|s| *s == "Synced").count();

    Json(serde_json::json!({
        "status": if books.is_shut_down() { "stopping" } else { "healthy" },
        "component": "book-sync",
        "books": keys,
        "synced": synced,
        "pending_jobs": books.pending_jobs(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics() -> String {
    telemetry::gather()
}

async fn get_book(
    State(books): State<Manager>,
    Path(key): Path<String>,
) -> Result<Json<Book>, StatusCode> {
    let key: Key = key.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    books.get_book(&key).map(Json).ok_or(StatusCode::NOT_FOUND)
}
