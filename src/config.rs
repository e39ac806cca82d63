use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::verification::DEFAULT_MAX_TIMESTAMP_AGE;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_BUILD_LOG_DIR: &str = "logs";
const DEFAULT_MAX_CONCURRENT_BUILDS: usize = 2;
const DEFAULT_MLFLOW_BIN: &str = "mlflow";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// A credential that never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Process settings, read once at start-up and shared by reference.
#[derive(Debug, Clone)]
pub struct Settings {
    pub webhook_secret: SecretString,
    pub docker_registry: String,
    pub docker_username: String,
    /// Registry login is skipped when unset.
    pub docker_password: Option<SecretString>,
    pub max_timestamp_age: u64,
    pub host: IpAddr,
    pub port: u16,
    pub build_log_dir: PathBuf,
    pub max_concurrent_builds: usize,
    pub mlflow_bin: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        let max_concurrent_builds = parse_or(
            "MAX_CONCURRENT_BUILDS",
            optional("MAX_CONCURRENT_BUILDS"),
            DEFAULT_MAX_CONCURRENT_BUILDS,
        )?;
        if max_concurrent_builds == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_BUILDS",
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            webhook_secret: SecretString::new(required("WEBHOOK_SECRET")?),
            docker_registry: optional("DOCKER_REGISTRY")
                .unwrap_or_else(|| DEFAULT_REGISTRY.to_owned()),
            docker_username: required("DOCKER_USERNAME")?,
            docker_password: optional("DOCKER_PASSWORD").map(SecretString::new),
            max_timestamp_age: parse_or(
                "MAX_TIMESTAMP_AGE",
                optional("MAX_TIMESTAMP_AGE"),
                DEFAULT_MAX_TIMESTAMP_AGE,
            )?,
            host: parse_or("HOST", optional("HOST"), IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse_or("PORT", optional("PORT"), DEFAULT_PORT)?,
            build_log_dir: optional("BUILD_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_LOG_DIR)),
            max_concurrent_builds,
            mlflow_bin: optional("MLFLOW_BIN").unwrap_or_else(|| DEFAULT_MLFLOW_BIN.to_owned()),
        })
    }

    pub fn socket_address(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings(webhook_secret={}, docker_registry={}, docker_username={}, docker_password={}, max_timestamp_age={}, listen={}, build_log_dir={})",
            self.webhook_secret,
            self.docker_registry,
            self.docker_username,
            if self.docker_password.is_some() { "***" } else { "<unset>" },
            self.max_timestamp_age,
            self.socket_address(),
            self.build_log_dir.display(),
        )
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("'{value}': {e}"),
        }),
        None => Ok(default),
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
