use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gantry::cluster::kube::KubeCluster;
use gantry::config::Config;
use gantry::object::ArtifactStore;
use gantry::scm::github::GithubProvider;
use gantry::store::postgres::PgKv;
use gantry::store::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("GANTRY_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let config = Config::load();

    let kv = PgKv::connect(&config.database_url).await?;
    let artifacts = ArtifactStore::s3(&config)?;
    let cluster = KubeCluster::connect()
        .await
        .map_err(|e| anyhow::anyhow!("kubernetes client: {e}"))?;
    let scm = GithubProvider::new(
        config.github_client_id.clone(),
        config.github_client_secret.clone(),
    );

    let state = AppState {
        kv: Arc::new(kv),
        artifacts,
        cluster: Arc::new(cluster),
        scm: Arc::new(scm),
        config: Arc::new(config.clone()),
    };

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .merge(gantry::api::router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = config.listen.parse()?;
    tracing::info!(%addr, "starting gantry");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("gantry stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
