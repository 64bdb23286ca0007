use anyhow::Result;
use axum::{
    Router,
    extract::Request,
    http::Uri,
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
};
use axum_server::tls_rustls::RustlsConfig;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use driftbay_api::{AppState, create_router};
use driftbay_catalog::CatalogService;
use driftbay_engine::{LocalStore, MultipartEngine, ResumableWriter, StoreConfig, sweep_orphans};
use driftbay_session::SessionRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub database_url: String,
    pub data_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub log_level: String,
    /// Terminal sessions are purged this many hours after their last
    /// transition; their scratch goes with them.
    pub session_retention_hours: i64,
    pub janitor_interval_secs: u64,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub https_port: Option<u16>,
    pub redirect_http_to_https: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3000,
            database_url: "sqlite:./driftbay.db".to_string(),
            data_dir: PathBuf::from("./data"),
            scratch_dir: PathBuf::from("./scratch"),
            log_level: "info".to_string(),
            session_retention_hours: 24,
            janitor_interval_secs: 300,
            tls: None,
        }
    }
}

pub struct DriftBayServer {
    config: ServerConfig,
}

impl DriftBayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        self.setup_tracing()?;

        tracing::info!("Starting DriftBay server...");
        tracing::info!("Configuration: {:?}", self.config);

        // Catalog + migrations
        let catalog = CatalogService::new(&self.config.database_url).await?;
        driftbay_catalog::migrations::ensure_database_exists(&self.config.database_url).await?;
        driftbay_catalog::migrations::run_migrations(catalog.pool()).await?;

        // Byte store and the two upload pipelines over one registry
        let store = LocalStore::new(StoreConfig {
            data_dir: self.config.data_dir.clone(),
            scratch_dir: self.config.scratch_dir.clone(),
        })?;
        let registry = Arc::new(SessionRegistry::new());
        let writer = Arc::new(ResumableWriter::new(Arc::clone(&registry), store.clone()));
        let multipart = Arc::new(MultipartEngine::new(Arc::clone(&registry), store.clone()));

        spawn_janitor(
            Arc::clone(&registry),
            store.clone(),
            chrono::Duration::hours(self.config.session_retention_hours),
            Duration::from_secs(self.config.janitor_interval_secs),
        );

        let app_state = AppState {
            catalog,
            registry,
            writer,
            multipart,
            store,
        };

        let app = create_router()
            .with_state(app_state)
            .layer(middleware::from_fn(security_headers_middleware));

        match self.config.tls.clone() {
            Some(tls_config) => self.run_with_tls(app, tls_config).await,
            None => self.run_http_only(app).await,
        }
    }

    async fn run_http_only(self, app: Router) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("DriftBay server listening on http://{}", addr);
        tracing::info!("Health check available at: http://{}/health", addr);
        tracing::warn!("TLS is disabled. Consider enabling HTTPS in production!");

        axum::serve(listener, app).await?;
        Ok(())
    }

    async fn run_with_tls(self, app: Router, tls_config: TlsConfig) -> Result<()> {
        let rustls_config =
            RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path).await?;

        let https_port = tls_config.https_port.unwrap_or(443);
        let https_addr: SocketAddr =
            format!("{}:{}", self.config.bind_address, https_port).parse()?;

        tracing::info!("DriftBay server listening on https://{}", https_addr);

        if tls_config.redirect_http_to_https {
            let redirect_app = Router::new()
                .fallback(redirect_to_https)
                .layer(middleware::from_fn(security_headers_middleware));

            let http_addr: SocketAddr =
                format!("{}:{}", self.config.bind_address, self.config.port).parse()?;
            let http_listener = TcpListener::bind(http_addr).await?;

            tracing::info!("HTTP redirect server listening on http://{}", http_addr);

            tokio::spawn(async move {
                if let Err(e) = axum::serve(http_listener, redirect_app).await {
                    tracing::error!("HTTP redirect server error: {}", e);
                }
            });
        }

        axum_server::bind_rustls(https_addr, rustls_config)
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }

    fn setup_tracing(&self) -> Result<()> {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.config.log_level));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();

        Ok(())
    }
}

/// Periodically drops expired terminal sessions and any scratch state with
/// no live session behind it.
fn spawn_janitor(
    registry: Arc<SessionRegistry>,
    store: LocalStore,
    retention: chrono::Duration,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for upload_id in registry.purge_terminal(retention) {
                if let Err(e) = store.remove_scratch(&upload_id).await {
                    tracing::warn!(%upload_id, error = %e, "failed to drop purged scratch");
                }
            }
            if let Err(e) = sweep_orphans(&registry, &store).await {
                tracing::warn!(error = %e, "scratch sweep failed");
            }
        }
    });
}

// Security headers middleware
async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();

    headers.insert(
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains; preload".parse().unwrap(),
    );
    headers.insert(
        "Content-Security-Policy",
        "default-src 'self'; object-src 'none'; frame-ancestors 'none'".parse().unwrap(),
    );
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert("Referrer-Policy", "strict-origin-when-cross-origin".parse().unwrap());

    response
}

// HTTPS redirect handler
async fn redirect_to_https(uri: Uri) -> impl IntoResponse {
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or("localhost");
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let host = authority.split(':').next().unwrap_or(authority);
    let https_url = format!("https://{}{}", host, path_and_query);

    Redirect::permanent(&https_url)
}
