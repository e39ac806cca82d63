use std::future::Future;
use std::io;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatch::{Dispatcher, RequiredHeader, SignedRequest, WebhookError};

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorBody {
            detail: self.to_string(),
        });
        (self.status(), payload).into_response()
    }
}

pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, dispatcher: Dispatcher, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "webhook server listening");
    }
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_webhook(
    State(dispatcher): State<Dispatcher>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StatusBody>), WebhookError> {
    let request = SignedRequest {
        signature: required_header(&headers, RequiredHeader::Signature)?,
        delivery_id: required_header(&headers, RequiredHeader::DeliveryId)?,
        timestamp: required_header(&headers, RequiredHeader::Timestamp)?,
        body,
    };

    dispatcher.dispatch(&request)?;

    Ok((StatusCode::ACCEPTED, Json(StatusBody { status: "submitted" })))
}

async fn health() -> Json<StatusBody> {
    Json(StatusBody { status: "healthy" })
}

fn required_header(headers: &HeaderMap, header: RequiredHeader) -> Result<String, WebhookError> {
    let value = headers
        .get(header.name())
        .ok_or(WebhookError::HeaderMissing(header))?
        .to_str()
        .map_err(|_| WebhookError::HeaderInvalid(header))?;
    if value.is_empty() {
        return Err(WebhookError::HeaderEmpty(header));
    }
    Ok(value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_settings, RecordingScheduler, TEST_SECRET};
    use crate::verification;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct TestServer {
        base_url: String,
        scheduler: Arc<RecordingScheduler>,
        client: reqwest::Client,
        _stop: tokio::sync::oneshot::Sender<()>,
    }

    impl TestServer {
        async fn start() -> Self {
            let scheduler = RecordingScheduler::shared();
            let dispatcher = Dispatcher::new(Arc::new(test_settings()), scheduler.clone());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(serve(listener, dispatcher, async move {
                let _ = stopped.await;
            }));

            Self {
                base_url,
                scheduler,
                client: reqwest::Client::new(),
                _stop: stop,
            }
        }

        async fn post(&self, headers: &[(&str, String)], body: String) -> (u16, Value) {
            let mut request = self.client.post(format!("{}/webhook", self.base_url));
            for (name, value) in headers {
                request = request.header(*name, value);
            }
            let response = request
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap())
        }

        async fn deliver(&self, body: &Value, secret: &str, age: i64) -> (u16, Value) {
            let body = body.to_string();
            let timestamp = (Utc::now().timestamp() - age).to_string();
            let signature =
                verification::sign(secret, body.as_bytes(), "test-delivery-id", &timestamp)
                    .unwrap();
            let headers = [
                ("X-MLflow-Signature", signature),
                ("X-MLflow-Delivery-ID", "test-delivery-id".to_owned()),
                ("X-MLflow-Timestamp", timestamp),
            ];
            self.post(&headers, body).await
        }
    }

    fn model_version_created() -> Value {
        json!({
            "entity": "model_version",
            "action": "created",
            "data": {
                "name": "test-model",
                "source": "models:/test-model/1",
                "version": "1",
                "run_id": null,
                "tags": {},
                "description": null
            }
        })
    }

    #[tokio::test]
    async fn valid_delivery_is_submitted() {
        let server = TestServer::start().await;

        let (status, body) = server.deliver(&model_version_created(), TEST_SECRET, 0).await;

        assert_eq!(status, 202);
        assert_eq!(body, json!({ "status": "submitted" }));
        let jobs = server.scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].model_uri, "models:/test-model/1");
    }

    #[tokio::test]
    async fn old_timestamp_is_rejected() {
        let server = TestServer::start().await;

        let (status, body) = server.deliver(&model_version_created(), TEST_SECRET, 400).await;

        assert_eq!(status, 400);
        assert!(body["detail"].as_str().unwrap().contains("Timestamp"));
        assert!(server.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let server = TestServer::start().await;

        let (status, body) = server
            .deliver(&model_version_created(), "wrong-secret", 0)
            .await;

        assert_eq!(status, 401);
        assert_eq!(body, json!({ "detail": "Invalid signature" }));
        assert!(server.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_is_accepted_without_a_build() {
        let server = TestServer::start().await;
        let event = json!({ "entity": "unknown_entity", "action": "unknown_action", "data": {} });

        let (status, body) = server.deliver(&event, TEST_SECRET, 0).await;

        assert_eq!(status, 202);
        assert_eq!(body, json!({ "status": "submitted" }));
        assert!(server.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn alias_created_schedules_alias_build() {
        let server = TestServer::start().await;
        let event = json!({
            "entity": "model_version_alias",
            "action": "created",
            "data": { "name": "test-model", "alias": "champion", "version": "3" }
        });

        let (status, _) = server.deliver(&event, TEST_SECRET, 0).await;

        assert_eq!(status, 202);
        let jobs = server.scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].model_uri, "models:/test-model@champion");
        assert_eq!(jobs[0].image().to_string(), "test-registry.io/testuser/test-model:champion");
    }

    #[tokio::test]
    async fn tag_set_is_accepted_without_a_build() {
        let server = TestServer::start().await;
        let event = json!({
            "entity": "model_version_tag",
            "action": "set",
            "data": { "name": "test-model", "version": "1", "key": "k", "value": "v" }
        });

        let (status, _) = server.deliver(&event, TEST_SECRET, 0).await;

        assert_eq!(status, 202);
        assert!(server.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_unprocessable() {
        let server = TestServer::start().await;
        let event = json!({ "entity": "model_version", "action": "created", "data": {} });

        let (status, body) = server.deliver(&event, TEST_SECRET, 0).await;

        assert_eq!(status, 422);
        assert!(body["detail"].is_string());
        assert!(server.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn missing_and_empty_headers() {
        let server = TestServer::start().await;
        let body = model_version_created().to_string();
        let timestamp = Utc::now().timestamp().to_string();

        let (status, response) = server
            .post(
                &[
                    ("X-MLflow-Signature", "v1,abc".to_owned()),
                    ("X-MLflow-Timestamp", timestamp.clone()),
                ],
                body.clone(),
            )
            .await;
        assert_eq!(status, 422);
        assert_eq!(
            response["detail"],
            "Missing required header: X-MLflow-Delivery-ID"
        );

        let (status, response) = server
            .post(
                &[
                    ("X-MLflow-Signature", String::new()),
                    ("X-MLflow-Delivery-ID", "d".to_owned()),
                    ("X-MLflow-Timestamp", timestamp),
                ],
                body,
            )
            .await;
        assert_eq!(status, 400);
        assert_eq!(response["detail"], "Missing signature header");
        assert!(server.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let server = TestServer::start().await;

        let response = server
            .client
            .get(format!("{}/health", server.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "status": "healthy" }));
    }
}
