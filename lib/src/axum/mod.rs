pub mod certify;
pub mod error;
pub mod extract;
pub mod mail;
pub mod tracking;

use std::sync::Arc;

use axum::Extension;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::chain::{Chain, PolygonRpc};
use crate::dispatch::Dispatcher;
use crate::email::{Mailer, RecordingMailer, SmtpMailer};
use crate::Result;
use crate::{Config, Database};

pub type Router = axum::Router;

pub type ConfigExt<C = Config> = Extension<Arc<C>>;
pub type DbExt = Extension<Arc<Database>>;
/// Chain client, absent when no provider is configured.
pub type ChainExt = Extension<Option<Arc<dyn Chain>>>;

/// Collects all the routes: the public tracking endpoints and the mail api.
pub fn router() -> Router {
    Router::new()
        .merge(tracking::router())
        .merge(mail::router())
        .merge(certify::router())
}

/// Full application with state extensions and request tracing applied.
pub fn app(db: Database, config: Arc<Config>, chain: Option<Arc<dyn Chain>>) -> Router {
    router().layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            // Register common state extensions for all routes
            .layer(Extension(config))
            .layer(Extension(Arc::new(db)))
            .layer(Extension(chain)),
    )
}

/// Initializes application state, spawns the dispatcher and starts the web
/// server.
pub async fn start(config: Config) -> Result<()> {
    let db = Database::new(&config.db)?;
    let mailer: Arc<dyn Mailer> = if config.email.dry_run {
        tracing::warn!("email dry run enabled, nothing will be sent");
        Arc::new(RecordingMailer::new())
    } else {
        Arc::new(SmtpMailer::new(&config)?)
    };
    start_with(db, mailer, config).await
}

pub async fn start_with(db: Database, mailer: Arc<dyn Mailer>, config: Config) -> Result<()> {
    crate::tracing::init(&config).unwrap_or_else(|e| {
        log::warn!("failed to initialize tracing (perhaps it was already initialized?): {e}")
    });

    let chain: Option<Arc<dyn Chain>> = match PolygonRpc::new(&config.chain) {
        Ok(rpc) => Some(Arc::new(rpc)),
        Err(e) => {
            tracing::info!("certification disabled: {e}");
            None
        }
    };

    let config = Arc::new(config);
    let addr = config.address;

    let dispatcher = Dispatcher::new(db.clone(), mailer, config.clone());
    tokio::spawn(async move {
        if let Err(e) = dispatcher.run().await {
            tracing::error!("dispatcher stopped: {e}");
        }
    });

    let router = app(db, config, chain);

    // Serve the application
    tracing::info!("starting server at {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await.map_err(|e| e.into())
}
