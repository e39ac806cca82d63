use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Attempts at finding a free file name before giving up.
const MAX_NAME_COLLISIONS: u32 = 100;

/// Append-only log file owned by one build.
///
/// The packaging child process writes to it directly through [`BuildLog::stdio`];
/// everything else goes through [`BuildLog::append`].
pub struct BuildLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl BuildLog {
    /// Create a fresh log file under `log_dir` for a build of
    /// `model_name:version` started at `started_at`.
    pub async fn create(
        log_dir: &Path,
        model_name: &str,
        version: &str,
        started_at: DateTime<Utc>,
    ) -> io::Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;

        let stem = log_file_stem(model_name, version, started_at);
        for attempt in 0..MAX_NAME_COLLISIONS {
            let name = match attempt {
                0 => format!("{stem}.log"),
                n => format!("{stem}-{n}.log"),
            };
            let path = log_dir.join(name);
            match OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        file: Mutex::new(file),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free build log name for {stem} in {}", log_dir.display()),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await
    }

    /// Like [`BuildLog::append`], but a failed write is only reported to the
    /// process log so that it never aborts the build.
    pub async fn note(&self, line: &str) {
        if let Err(e) = self.append(line).await {
            warn!(path = %self.path.display(), error = %e, "failed to write build log");
        }
    }

    /// A handle to the log suitable for a child process's stdout or stderr.
    pub async fn stdio(&self) -> io::Result<Stdio> {
        let file = self.file.lock().await;
        let handle = file.try_clone().await?;
        Ok(Stdio::from(handle.into_std().await))
    }
}

/// `{name}_{version}_{YYYYmmdd_HHMMSS_mmm}` with path-hostile characters replaced.
pub fn log_file_stem(model_name: &str, version: &str, started_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        sanitize(model_name),
        sanitize(version),
        started_at.format("%Y%m%d_%H%M%S_%3f")
    )
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | ':' | '\\' => '_',
            c => c,
        })
        .collect()
}
