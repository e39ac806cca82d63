mod build_log;
mod config;
mod dispatch;
mod http_server;
mod packager;
mod pipeline;
mod registry;
#[cfg(test)]
mod testing;
mod types;
mod verification;

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::{ConfigError, Settings};
use dispatch::Dispatcher;
use packager::MlflowCliPackager;
use pipeline::BuildPipeline;
use registry::{DockerEngineRegistry, RegistryPusher, RetryPolicy};

#[derive(Debug, Error)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to connect to the docker engine: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    dotenvy::dotenv().ok();
    config::init_tracing();

    let settings = Arc::new(Settings::from_env()?);
    info!(settings = %settings, "loaded configuration");

    let registry = DockerEngineRegistry::connect_local()?;
    let pipeline = BuildPipeline::new(
        Arc::new(MlflowCliPackager::new(settings.mlflow_bin.clone())),
        RegistryPusher::new(Arc::new(registry), RetryPolicy::default()),
        settings.build_log_dir.clone(),
        settings.max_concurrent_builds,
    );
    let dispatcher = Dispatcher::new(settings.clone(), Arc::new(pipeline));

    let addr = settings.socket_address();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;

    http_server::serve(listener, dispatcher, shutdown_signal())
        .await
        .map_err(StartupError::Serve)?;

    info!("webhook server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
