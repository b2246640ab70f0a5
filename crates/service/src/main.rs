//! Relay service entry point.

use std::sync::Arc;

use message_store::{InMemoryMessageStore, InboxStore, OutboxStore, PostgresMessageStore};
use metrics_exporter_prometheus::PrometheusHandle;
use relay::{HandlerRegistry, LoopbackBroker};
use service::{Config, LogFormat, Workers};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<S>(store: Arc<S>, config: Config, metrics_handle: PrometheusHandle)
where
    S: OutboxStore + InboxStore + 'static,
{
    // Inbox handlers of the embedding service are registered here.
    let registry = Arc::new(HandlerRegistry::new());
    let broker = Arc::new(LoopbackBroker::new(store.clone()));
    let workers = Workers::spawn(store, broker, registry, config.publisher, config.processor);

    let app = service::create_app(metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting relay service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    workers.shutdown().await;
    tracing::info!("service shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Select the message store and start serving
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresMessageStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL message store");
            serve(Arc::new(store), config, metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory message store");
            serve(Arc::new(InMemoryMessageStore::new()), config, metrics_handle).await;
        }
    }
}
