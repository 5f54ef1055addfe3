//! Minimal operator binary for a tpre worker node.
//!
//! Wires the worker library to a file keystore, a file-backed registry
//! oracle and a permissive condition evaluator, then serves until ctrl-c.
//! Real deployments substitute their chain-backed oracle and their
//! predicate evaluator at the same two seams.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use tpre_worker::config::WorkerConfig;
use tpre_worker::{FileKeystore, StartedServices, WorkerServiceBuilder, default_shutdown_signal};

mod static_oracle;
use static_oracle::{AllowAllEvaluator, StaticRegistryOracle};

/// The configuration for the worker example.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
pub struct ExampleWorkerConfig {
    /// The bind addr of the AXUM server.
    #[clap(long, env = "TPRE_WORKER_BIND_ADDR", default_value = "0.0.0.0:9151")]
    pub bind_addr: SocketAddr,

    /// JSON file listing the authorized workers (the stand-in for the
    /// on-chain registry).
    #[clap(long, env = "TPRE_WORKER_REGISTRY_FILE", default_value = "registry.json")]
    pub registry_file: PathBuf,

    /// Max wait time the service waits for its workers during shutdown.
    #[clap(
        long,
        env = "TPRE_WORKER_MAX_WAIT_TIME_SHUTDOWN",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub max_wait_time_shutdown: Duration,

    /// The worker service config.
    #[clap(flatten)]
    pub service_config: WorkerConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tpre_worker=info,info".into()),
        )
        .init();
    tracing::info!("tpre-worker {}", env!("CARGO_PKG_VERSION"));

    let config = ExampleWorkerConfig::parse();

    let keystore = Arc::new(
        FileKeystore::init(
            config.service_config.keystore_dir.clone(),
            config.service_config.keystore_passphrase.clone(),
        )
        .await
        .context("while opening keystore")?,
    );
    let oracle = Arc::new(
        StaticRegistryOracle::load(&config.registry_file)
            .await
            .context("while loading registry file")?,
    );

    let result = start_service(config, keystore, oracle, default_shutdown_signal()).await;
    match result {
        Ok(()) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            // we don't want to double print the error therefore we just return FAILURE
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn start_service(
    config: ExampleWorkerConfig,
    keystore: Arc<FileKeystore>,
    oracle: Arc<StaticRegistryOracle>,
    shutdown_signal: impl Future<Output = ()>,
) -> eyre::Result<()> {
    let cancellation_token = CancellationToken::new();
    let builder = WorkerServiceBuilder::init(
        config.service_config,
        keystore,
        oracle,
        Arc::new(AllowAllEvaluator),
        StartedServices::new(),
        cancellation_token.clone(),
    )
    .await
    .context("while initializing worker")?;
    tracing::info!("node id: {}", builder.node_metadata().node_id);
    let (router, learning) = builder.build();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("while binding listener")?;
    tracing::info!("listening on {}", config.bind_addr);

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(cancellation_token.clone().cancelled_owned());
    tokio::select! {
        result = server => {
            result.context("while serving")?;
        }
        _ = shutdown_signal => {
            tracing::info!("shutdown signal received");
        }
    }

    cancellation_token.cancel();
    match tokio::time::timeout(config.max_wait_time_shutdown, learning).await {
        Ok(joined) => {
            joined.context("while joining learning loop")??;
        }
        Err(_) => tracing::warn!("learning loop did not stop in time"),
    }
    Ok(())
}
