//! Spectator relay entrypoint: serves live snapshots of shared games over REST and SSE.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netball_scoreboard::{
    auth::{IdentityProvider, MemoryIdentityProvider},
    clock::{Clock, SystemClock},
    config::SyncConfig,
    dao::{
        remote::{RemoteStore, memory::MemoryRemoteStore},
        storage::StorageError,
    },
    routes,
    services::storage_supervisor,
    state::{AppState, SharedState},
};

type Connector =
    Box<dyn FnMut() -> BoxFuture<'static, Result<Arc<dyn RemoteStore>, StorageError>> + Send>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = SyncConfig::load();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // Spectators never sign in; reads rely on the public-visibility rule.
    let identity: Arc<dyn IdentityProvider> = Arc::new(MemoryIdentityProvider::new());

    let app_state = AppState::new(clock.clone(), config);
    tokio::spawn(storage_supervisor::run(
        app_state.clone(),
        remote_connector(identity, clock),
    ));
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting spectator relay");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Pick the remote backend: CouchDB when configured, otherwise an in-process store.
fn remote_connector(identity: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>) -> Connector {
    #[cfg(feature = "couch-store")]
    {
        use netball_scoreboard::dao::remote::couchdb::{CouchConfig, CouchRemoteStore};

        match CouchConfig::from_env() {
            Ok(couch) => {
                info!(base_url = %couch.base_url, database = %couch.database, "using CouchDB remote store");
                return Box::new(move || {
                    let couch = couch.clone();
                    let identity = identity.clone();
                    let clock = clock.clone();
                    Box::pin(async move {
                        let store = CouchRemoteStore::connect(couch, identity, clock).await?;
                        Ok(Arc::new(store) as Arc<dyn RemoteStore>)
                    })
                });
            }
            Err(err) => info!(reason = %err, "CouchDB not configured"),
        }
    }

    info!("using in-memory remote store");
    let store = MemoryRemoteStore::new(identity, clock);
    Box::new(move || {
        let store = store.clone();
        Box::pin(async move { Ok(Arc::new(store) as Arc<dyn RemoteStore>) })
    })
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
