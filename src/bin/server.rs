//! Sitesync reference server
//!
//! Serves the document API the sync engine talks to, keeping rows in
//! memory. Useful for local development and for exercising the engine
//! end to end.
//!
//! # Configuration
//!
//! Environment variables:
//! - `SITESYNC_SERVER_PORT`: Port to listen on (default: 5000)
//! - `SITESYNC_SERVER_HOST`: Address to bind (default: 0.0.0.0)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint
//! - `GET|POST /api/{resource}`, `PUT|DELETE /api/{resource}/{id}`:
//!   document rows, partitioned by the `x-client-id` header

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use sitesync::server::{router, CollectionStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 5000;

/// Server configuration
#[derive(Debug, Clone)]
struct ServerConfig {
    host: IpAddr,
    port: u16,
}

impl ServerConfig {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("SITESYNC_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let host = std::env::var("SITESYNC_SERVER_HOST")
            .ok()
            .and_then(|h| h.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        Self { host, port }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sitesync=info,sitesync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let app = router(CollectionStore::new());

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
