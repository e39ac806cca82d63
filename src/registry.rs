use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::image::PushImageOptions;
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::build_log::BuildLog;
use crate::types::{ImageReference, RegistryCredentials};

/// Error reported by the container engine or registry transport.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

/// One line of push progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushEvent {
    pub status: Option<String>,
    pub error: Option<String>,
}

/// The slice of a container engine the pusher needs.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), EngineError>;

    fn push<'a>(
        &'a self,
        image: &'a ImageReference,
        credentials: Option<&'a RegistryCredentials>,
    ) -> BoxStream<'a, Result<PushEvent, EngineError>>;
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("authentication against {registry} failed: {message}")]
    Auth { registry: String, message: String },
    #[error("registry rejected push of {image}: {message}")]
    Rejected { image: String, message: String },
    #[error("transport error while pushing {image}: {message}")]
    Transport { image: String, message: String },
}

impl PushError {
    /// Bad credentials do not fix themselves; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth { .. })
    }
}

/// Exponential backoff between push attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct RegistryPusher {
    client: Arc<dyn RegistryClient>,
    retry: RetryPolicy,
}

impl RegistryPusher {
    pub fn new(client: Arc<dyn RegistryClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Push `image`, logging in first when credentials are given. Transient
    /// failures are retried; the error from the last attempt is returned as is.
    pub async fn push(
        &self,
        image: &ImageReference,
        credentials: Option<&RegistryCredentials>,
        log: &BuildLog,
    ) -> Result<(), PushError> {
        let mut attempt = 1;
        loop {
            match self.push_once(image, credentials, log).await {
                Ok(()) => {
                    info!(image = %image, attempt, "image pushed");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        image = %image,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "push failed, retrying"
                    );
                    let line = format!("push attempt {attempt} failed: {e}; retrying in {delay:?}");
                    log.note(&line).await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn push_once(
        &self,
        image: &ImageReference,
        credentials: Option<&RegistryCredentials>,
        log: &BuildLog,
    ) -> Result<(), PushError> {
        if let Some(credentials) = credentials {
            self.client
                .login(credentials)
                .await
                .map_err(|e| PushError::Auth {
                    registry: credentials.registry.clone(),
                    message: e.0,
                })?;
            info!(
                registry = %credentials.registry,
                username = %credentials.username,
                "registry login succeeded"
            );
        }

        info!(image = %image, "pushing image");
        let mut events = self.client.push(image, credentials);
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| PushError::Transport {
                image: image.to_string(),
                message: e.0,
            })?;
            if let Some(status) = &event.status {
                info!(image = %image, status = %status, "push status");
                log.note(&format!("push: {status}")).await;
            }
            if let Some(message) = event.error {
                error!(image = %image, error = %message, "push error");
                return Err(PushError::Rejected {
                    image: image.to_string(),
                    message,
                });
            }
        }
        Ok(())
    }
}

/// Registry access through the local Docker Engine.
///
/// Pushes go through the engine API; login is delegated to the `docker` CLI
/// so that bad credentials surface before any layer is uploaded.
pub struct DockerEngineRegistry {
    docker: Docker,
    docker_cli: String,
}

impl DockerEngineRegistry {
    pub fn connect_local() -> Result<Self, bollard::errors::Error> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
            docker_cli: "docker".to_owned(),
        })
    }
}

#[async_trait]
impl RegistryClient for DockerEngineRegistry {
    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), EngineError> {
        let mut child = tokio::process::Command::new(&self.docker_cli)
            .args([
                "login",
                "--username",
                credentials.username.as_str(),
                "--password-stdin",
                credentials.registry.as_str(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError(format!("failed to run {}: {e}", self.docker_cli)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(credentials.password.expose().as_bytes())
                .await
                .map_err(|e| EngineError(format!("failed to pass password to docker login: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError(format!("docker login did not complete: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ))
        }
    }

    fn push<'a>(
        &'a self,
        image: &'a ImageReference,
        credentials: Option<&'a RegistryCredentials>,
    ) -> BoxStream<'a, Result<PushEvent, EngineError>> {
        let options = PushImageOptions {
            tag: image.tag.clone(),
        };
        let credentials = credentials.map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.expose().to_owned()),
            serveraddress: Some(c.registry.clone()),
            ..Default::default()
        });

        self.docker
            .push_image(&image.repository(), Some(options), credentials)
            .map(|item| {
                item.map(|info| PushEvent {
                    status: info.status,
                    error: info.error,
                })
                .map_err(|e| EngineError(e.to_string()))
            })
            .boxed()
    }
}
