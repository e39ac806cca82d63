use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Settings;
use crate::pipeline::BuildScheduler;
use crate::types::{BuildJob, WebhookEvent};
use crate::verification;

/// The three headers every delivery must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredHeader {
    Signature,
    DeliveryId,
    Timestamp,
}

impl RequiredHeader {
    pub fn name(self) -> &'static str {
        match self {
            Self::Signature => "X-MLflow-Signature",
            Self::DeliveryId => "X-MLflow-Delivery-ID",
            Self::Timestamp => "X-MLflow-Timestamp",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::DeliveryId => "delivery ID",
            Self::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing required header: {}", .0.name())]
    HeaderMissing(RequiredHeader),
    #[error("Missing {} header", .0.label())]
    HeaderEmpty(RequiredHeader),
    #[error("Header {} is not valid text", .0.name())]
    HeaderInvalid(RequiredHeader),
    #[error("Timestamp is too old or invalid (possible replay attack)")]
    StaleTimestamp,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HeaderMissing(_) | Self::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::HeaderEmpty(_) | Self::HeaderInvalid(_) | Self::StaleTimestamp => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidSignature => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Raw body plus the header values it was signed with. Used once, never stored.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub signature: String,
    pub delivery_id: String,
    pub timestamp: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Scheduled(BuildJob),
    Ignored(String),
}

/// Authenticates deliveries and hands recognized ones to the scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    settings: Arc<Settings>,
    scheduler: Arc<dyn BuildScheduler>,
}

impl Dispatcher {
    pub fn new(settings: Arc<Settings>, scheduler: Arc<dyn BuildScheduler>) -> Self {
        Self {
            settings,
            scheduler,
        }
    }

    /// Freshness first, then the HMAC. Both must pass.
    pub fn authenticate(&self, request: &SignedRequest) -> Result<(), WebhookError> {
        if !verification::is_fresh(&request.timestamp, self.settings.max_timestamp_age) {
            warn!(
                delivery_id = %request.delivery_id,
                timestamp = %request.timestamp,
                "rejected stale webhook"
            );
            return Err(WebhookError::StaleTimestamp);
        }

        let valid = verification::verify_signature(
            self.settings.webhook_secret.expose(),
            &request.body,
            &request.delivery_id,
            &request.timestamp,
            &request.signature,
        );
        if !valid {
            warn!(delivery_id = %request.delivery_id, "rejected webhook with invalid signature");
            return Err(WebhookError::InvalidSignature);
        }
        Ok(())
    }

    /// Decide what a verified event asks for. Nothing is scheduled here.
    pub fn classify(&self, event: WebhookEvent) -> Disposition {
        match event {
            WebhookEvent::ModelVersionCreated(created) => {
                Disposition::Scheduled(self.job(created.source, created.name, created.version))
            }
            WebhookEvent::ModelVersionAliasCreated(alias) => {
                let model_uri = format!("models:/{}@{}", alias.name, alias.alias);
                Disposition::Scheduled(self.job(model_uri, alias.name, alias.alias))
            }
            other => Disposition::Ignored(other.kind()),
        }
    }

    fn job(&self, model_uri: String, model_name: String, version: String) -> BuildJob {
        BuildJob {
            model_uri,
            model_name,
            version,
            registry: self.settings.docker_registry.clone(),
            username: self.settings.docker_username.clone(),
            password: self.settings.docker_password.clone(),
        }
    }

    /// Authenticate, parse and classify `request`, scheduling a build when the
    /// event calls for one. Returns without waiting for the build.
    pub fn dispatch(&self, request: &SignedRequest) -> Result<Disposition, WebhookError> {
        self.authenticate(request)?;

        let event = WebhookEvent::from_json(&request.body)?;
        let kind = event.kind();
        let summary = event.summary();
        let disposition = self.classify(event);

        match &disposition {
            Disposition::Scheduled(job) => {
                info!(
                    delivery_id = %request.delivery_id,
                    event = %kind,
                    model = %job.model_name,
                    version = %job.version,
                    model_uri = %job.model_uri,
                    "scheduling image build"
                );
                self.scheduler.schedule(job.clone());
            }
            Disposition::Ignored(kind) => {
                info!(
                    delivery_id = %request.delivery_id,
                    event = %kind,
                    detail = summary.as_deref().unwrap_or_default(),
                    "no build for event"
                );
            }
        }
        Ok(disposition)
    }
}
