use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::build_log::BuildLog;
use crate::packager::{self, BuildError, ModelPackager};
use crate::registry::{PushError, RegistryPusher};
use crate::types::{BuildJob, ImageReference};

/// Hands build jobs off without waiting for them.
pub trait BuildScheduler: Send + Sync {
    fn schedule(&self, job: BuildJob);
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open build log: {0}")]
    Log(#[from] io::Error),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Push(#[from] PushError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub image: String,
    pub log_path: PathBuf,
}

/// Build-then-push for one model version, with all output of a run kept in
/// that run's own log file.
#[derive(Clone)]
pub struct BuildPipeline {
    packager: Arc<dyn ModelPackager>,
    pusher: Arc<RegistryPusher>,
    log_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl BuildPipeline {
    pub fn new(
        packager: Arc<dyn ModelPackager>,
        pusher: RegistryPusher,
        log_dir: PathBuf,
        max_concurrent_builds: usize,
    ) -> Self {
        Self {
            packager,
            pusher: Arc::new(pusher),
            log_dir,
            permits: Arc::new(Semaphore::new(max_concurrent_builds.max(1))),
        }
    }

    /// Build and push `job`, returning once both steps are done. A failed
    /// build is never followed by a push.
    pub async fn run(&self, job: &BuildJob) -> Result<BuildOutcome, PipelineError> {
        let image = job.image();
        let log =
            BuildLog::create(&self.log_dir, &job.model_name, &job.version, Utc::now()).await?;
        info!(image = %image, log = %log.path().display(), "build log allocated");

        log.note(&format!(
            "building {} from {} at {}",
            image,
            job.model_uri,
            Utc::now().to_rfc3339()
        ))
        .await;

        let result = self.build_and_push(job, &image, &log).await;
        match &result {
            Ok(()) => log.note("build and push succeeded").await,
            Err(e) => log.note(&format!("ERROR: {e}")).await,
        }
        result?;

        Ok(BuildOutcome {
            image: image.to_string(),
            log_path: log.path().to_path_buf(),
        })
    }

    async fn build_and_push(
        &self,
        job: &BuildJob,
        image: &ImageReference,
        log: &BuildLog,
    ) -> Result<(), PipelineError> {
        let image_name = image.to_string();
        let output =
            packager::build_image(self.packager.as_ref(), &job.model_uri, &image_name, log).await?;
        log.note(&format!("image built in {}s", output.elapsed.as_secs()))
            .await;

        let credentials = job.credentials();
        self.pusher.push(image, credentials.as_ref(), log).await?;
        Ok(())
    }

    /// Start `job` on its own task and return immediately. The outcome is
    /// only visible in the build log and the process log.
    pub fn run_detached(&self, job: BuildJob) {
        let pipeline = self.clone();
        let span = info_span!(
            "build",
            build_id = %Uuid::new_v4(),
            model = %job.model_name,
            version = %job.version,
        );

        tokio::spawn(
            async move {
                let Ok(_permit) = pipeline.permits.acquire().await else {
                    error!("build slots closed, dropping job");
                    return;
                };
                match pipeline.run(&job).await {
                    Ok(outcome) => info!(
                        image = %outcome.image,
                        log = %outcome.log_path.display(),
                        "build and push complete"
                    ),
                    Err(e) => error!(error = %e, "build and push failed"),
                }
            }
            .instrument(span),
        );
    }
}

impl BuildScheduler for BuildPipeline {
    fn schedule(&self, job: BuildJob) {
        self.run_detached(job);
    }
}
