use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::config::SecretString;

/// Raw webhook body before `data` is decoded against `(entity, action)`.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    entity: String,
    action: String,
    #[serde(default)]
    data: Value,
}

/// A model registry event, one variant per recognized `(entity, action)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    ModelVersionCreated(ModelVersionCreated),
    ModelVersionTagSet(ModelVersionTagSet),
    ModelVersionTagDeleted(ModelVersionTagDeleted),
    ModelVersionAliasCreated(ModelVersionAliasCreated),
    ModelVersionAliasDeleted(ModelVersionAliasDeleted),
    RegisteredModelCreated(RegisteredModelCreated),
    /// Accepted but ignored.
    Unrecognized { entity: String, action: String },
}

impl WebhookEvent {
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_slice(body)?;
        let event = match (raw.entity.as_str(), raw.action.as_str()) {
            ("model_version", "created") => {
                Self::ModelVersionCreated(serde_json::from_value(raw.data)?)
            }
            ("model_version_tag", "set") => Self::ModelVersionTagSet(serde_json::from_value(raw.data)?),
            ("model_version_tag", "deleted") => {
                Self::ModelVersionTagDeleted(serde_json::from_value(raw.data)?)
            }
            ("model_version_alias", "created") => {
                Self::ModelVersionAliasCreated(serde_json::from_value(raw.data)?)
            }
            ("model_version_alias", "deleted") => {
                Self::ModelVersionAliasDeleted(serde_json::from_value(raw.data)?)
            }
            ("registered_model", "created") => {
                Self::RegisteredModelCreated(serde_json::from_value(raw.data)?)
            }
            _ => Self::Unrecognized {
                entity: raw.entity,
                action: raw.action,
            },
        };
        Ok(event)
    }

    /// `entity.action` label used in logs.
    pub fn kind(&self) -> String {
        let (entity, action) = match self {
            Self::ModelVersionCreated(_) => ("model_version", "created"),
            Self::ModelVersionTagSet(_) => ("model_version_tag", "set"),
            Self::ModelVersionTagDeleted(_) => ("model_version_tag", "deleted"),
            Self::ModelVersionAliasCreated(_) => ("model_version_alias", "created"),
            Self::ModelVersionAliasDeleted(_) => ("model_version_alias", "deleted"),
            Self::RegisteredModelCreated(_) => ("registered_model", "created"),
            Self::Unrecognized { entity, action } => return format!("{entity}.{action}"),
        };
        format!("{entity}.{action}")
    }

    /// Human-readable account of an event that does not start a build.
    pub fn summary(&self) -> Option<String> {
        match self {
            Self::ModelVersionCreated(_) | Self::ModelVersionAliasCreated(_) => None,
            Self::ModelVersionTagSet(tag) => Some(format!(
                "Tag set on {} v{}: {}={}",
                tag.name, tag.version, tag.key, tag.value
            )),
            Self::ModelVersionTagDeleted(tag) => Some(format!(
                "Tag deleted on {} v{}: {}",
                tag.name, tag.version, tag.key
            )),
            Self::ModelVersionAliasDeleted(alias) => {
                Some(format!("Alias {} removed from {}", alias.alias, alias.name))
            }
            Self::RegisteredModelCreated(model) => {
                Some(format!("Registered model {} created", model.name))
            }
            Self::Unrecognized { entity, action } => {
                Some(format!("Unhandled event {entity}.{action}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVersionCreated {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub source: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVersionTagSet {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVersionTagDeleted {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVersionAliasCreated {
    pub name: String,
    pub alias: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVersionAliasDeleted {
    pub name: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisteredModelCreated {
    pub name: String,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub description: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(serde_json::Number),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

/// One build-and-push request, owned by a single pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildJob {
    /// Reference understood by the packaging tool, e.g. `models:/name/3`
    /// or `models:/name@champion`.
    pub model_uri: String,
    pub model_name: String,
    /// Version number or alias; both end up as the image tag.
    pub version: String,
    pub registry: String,
    pub username: String,
    pub password: Option<SecretString>,
}

impl BuildJob {
    pub fn image(&self) -> ImageReference {
        ImageReference {
            registry: self.registry.clone(),
            username: self.username.clone(),
            model_name: self.model_name.clone(),
            tag: self.version.clone(),
        }
    }

    /// Registry credentials, present only when a password was configured.
    pub fn credentials(&self) -> Option<RegistryCredentials> {
        self.password.as_ref().map(|password| RegistryCredentials {
            registry: self.registry.clone(),
            username: self.username.clone(),
            password: password.clone(),
        })
    }
}

/// `{registry}/{username}/{model_name}:{tag}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub username: String,
    pub model_name: String,
    pub tag: String,
}

impl ImageReference {
    /// Everything before the `:tag`.
    pub fn repository(&self) -> String {
        format!("{}/{}/{}", self.registry, self.username, self.model_name)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository(), self.tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCredentials {
    pub registry: String,
    pub username: String,
    pub password: SecretString,
}
