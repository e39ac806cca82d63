//! In-memory stand-ins for the packaging tool, the container engine and the
//! build scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::build_log::BuildLog;
use crate::config::{SecretString, Settings};
use crate::packager::{ModelPackager, PackagerFailure};
use crate::pipeline::BuildScheduler;
use crate::registry::{EngineError, PushEvent, RegistryClient};
use crate::types::{BuildJob, ImageReference, RegistryCredentials};

pub const TEST_SECRET: &str = "test-webhook-secret-key";

pub fn test_settings() -> Settings {
    Settings::from_lookup(|name| {
        let value = match name {
            "WEBHOOK_SECRET" => TEST_SECRET,
            "DOCKER_REGISTRY" => "test-registry.io",
            "DOCKER_USERNAME" => "testuser",
            "MAX_TIMESTAMP_AGE" => "300",
            _ => return None,
        };
        Some(value.to_owned())
    })
    .unwrap()
}

pub fn with_password(mut settings: Settings, password: &str) -> Settings {
    settings.docker_password = Some(SecretString::new(password));
    settings
}

pub fn status(text: &str) -> PushEvent {
    PushEvent {
        status: Some(text.to_owned()),
        error: None,
    }
}

pub struct FakePackager {
    failure: Option<String>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakePackager {
    pub fn succeeding() -> Self {
        Self {
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_owned()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelPackager for FakePackager {
    async fn package(
        &self,
        model_uri: &str,
        image_name: &str,
        log: &BuildLog,
    ) -> Result<(), PackagerFailure> {
        self.calls
            .lock()
            .unwrap()
            .push((model_uri.to_owned(), image_name.to_owned()));
        log.append(&format!("packaging {model_uri} as {image_name}"))
            .await?;
        match &self.failure {
            Some(message) => Err(message.clone().into()),
            None => Ok(()),
        }
    }
}

type PushScript = dyn Fn(usize) -> Vec<Result<PushEvent, EngineError>> + Send + Sync;

/// Registry whose push output is produced by a script keyed on the attempt
/// number (1-based).
pub struct FakeRegistry {
    script: Box<PushScript>,
    login_failure: Option<String>,
    logins: AtomicUsize,
    pushes: AtomicUsize,
    last_login_user: Mutex<Option<String>>,
}

impl FakeRegistry {
    pub fn new(
        script: impl Fn(usize) -> Vec<Result<PushEvent, EngineError>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            login_failure: None,
            logins: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            last_login_user: Mutex::new(None),
        }
    }

    pub fn accepting() -> Self {
        Self::new(|_| vec![Ok(status("Pushed"))])
    }

    pub fn rejecting_login(mut self, message: &str) -> Self {
        self.login_failure = Some(message.to_owned());
        self
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn last_login_user(&self) -> Option<String> {
        self.last_login_user.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn login(&self, credentials: &RegistryCredentials) -> Result<(), EngineError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        *self.last_login_user.lock().unwrap() = Some(credentials.username.clone());
        match &self.login_failure {
            Some(message) => Err(EngineError(message.clone())),
            None => Ok(()),
        }
    }

    fn push<'a>(
        &'a self,
        _image: &'a ImageReference,
        _credentials: Option<&'a RegistryCredentials>,
    ) -> BoxStream<'a, Result<PushEvent, EngineError>> {
        let attempt = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
        stream::iter((self.script)(attempt)).boxed()
    }
}

/// Scheduler that only remembers what it was asked to run.
#[derive(Default)]
pub struct RecordingScheduler {
    jobs: Mutex<Vec<BuildJob>>,
}

impl RecordingScheduler {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn jobs(&self) -> Vec<BuildJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl BuildScheduler for RecordingScheduler {
    fn schedule(&self, job: BuildJob) {
        self.jobs.lock().unwrap().push(job);
    }
}
