use std::error::Error as StdError;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::build_log::BuildLog;

/// Failure reported by a packaging backend, whatever its cause.
pub type PackagerFailure = Box<dyn StdError + Send + Sync>;

/// Turns a model reference into a local container image.
#[async_trait]
pub trait ModelPackager: Send + Sync {
    async fn package(
        &self,
        model_uri: &str,
        image_name: &str,
        log: &BuildLog,
    ) -> Result<(), PackagerFailure>;
}

#[derive(Debug, Error)]
#[error("failed to build image {image}: {message}")]
pub struct BuildError {
    pub image: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    pub image: String,
    pub elapsed: Duration,
}

/// Build `image_name` from `model_uri`, folding any backend failure into a
/// [`BuildError`].
pub async fn build_image(
    packager: &dyn ModelPackager,
    model_uri: &str,
    image_name: &str,
    log: &BuildLog,
) -> Result<BuildOutput, BuildError> {
    info!(image = image_name, model_uri, "starting image build");
    let started = Instant::now();

    match packager.package(model_uri, image_name, log).await {
        Ok(()) => {
            let elapsed = started.elapsed();
            info!(image = image_name, elapsed_secs = elapsed.as_secs(), "image build complete");
            Ok(BuildOutput {
                image: image_name.to_owned(),
                elapsed,
            })
        }
        Err(e) => {
            error!(image = image_name, error = %e, "image build failed");
            Err(BuildError {
                image: image_name.to_owned(),
                message: e.to_string(),
            })
        }
    }
}

/// Packages models with `mlflow models build-docker`, running it as a child
/// process whose output goes to the build's log file.
pub struct MlflowCliPackager {
    program: String,
}

impl MlflowCliPackager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ModelPackager for MlflowCliPackager {
    async fn package(
        &self,
        model_uri: &str,
        image_name: &str,
        log: &BuildLog,
    ) -> Result<(), PackagerFailure> {
        let status = tokio::process::Command::new(&self.program)
            .args(["models", "build-docker", "--model-uri", model_uri, "--name", image_name])
            .stdin(std::process::Stdio::null())
            .stdout(log.stdio().await?)
            .stderr(log.stdio().await?)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.program))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!("{} models build-docker exited with {status}", self.program).into())
        }
    }
}
