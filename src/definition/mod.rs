//! # Definition entities
//!
//! Branches, sources and sinks as stored by the definition repository. Each
//! entity carries its key, a business payload and the shared metadata blocks
//! [`Version`], [`SoftDeletable`] and, for sources and sinks, [`Switchable`].

pub mod key;

use std::fmt::Display;

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

pub use key::{BranchId, BranchKey, KeyError, ProjectId, SinkId, SinkKey, SourceId, SourceKey};

/// Length of a generated HTTP source secret.
pub const SECRET_LENGTH: usize = 48;

/// Version metadata; `number` starts at 1 and grows by one with every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub number: u32,
    /// First 16 hex characters of the SHA-256 of the entity JSON without its version.
    pub hash: String,
    pub description: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SoftDeletable {
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set when the entity was deleted by a cascade from an ancestor.
    #[serde(default)]
    pub deleted_with_parent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undeleted_at: Option<DateTime<Utc>>,
}

impl SoftDeletable {
    pub fn delete(&mut self, now: DateTime<Utc>, with_parent: bool) {
        self.deleted = true;
        self.deleted_at = Some(now);
        self.deleted_with_parent = with_parent;
    }

    pub fn undelete(&mut self, now: DateTime<Utc>) {
        self.deleted = false;
        self.deleted_at = None;
        self.deleted_with_parent = false;
        self.undeleted_at = Some(now);
    }
}

/// Enabled/disabled switch, orthogonal to deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Switchable {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

impl Switchable {
    pub fn enabled(&self) -> bool {
        !self.disabled
    }

    pub fn disable(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.disabled = true;
        self.disabled_at = Some(now);
        self.disabled_reason = Some(reason.into());
    }

    pub fn enable(&mut self) {
        self.disabled = false;
        self.disabled_at = None;
        self.disabled_reason = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    #[serde(flatten)]
    pub key: BranchKey,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub version: Version,
    #[serde(flatten)]
    pub soft_delete: SoftDeletable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HttpSource {
    pub secret: String,
}

impl HttpSource {
    /// Settings with a fresh random alphanumeric secret.
    pub fn generate() -> Self {
        let secret = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LENGTH)
            .map(char::from)
            .collect();
        Self { secret }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(flatten)]
    pub key: SourceKey,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,
    #[serde(default)]
    pub version: Version,
    #[serde(flatten)]
    pub soft_delete: SoftDeletable,
    #[serde(flatten)]
    pub switch: Switchable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Sink {
    #[serde(flatten)]
    pub key: SinkKey,
    /// Pipeline type resolved by the pipeline registry, e.g. `file`.
    #[serde(rename = "type")]
    pub sink_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub version: Version,
    #[serde(flatten)]
    pub soft_delete: SoftDeletable,
    #[serde(flatten)]
    pub switch: Switchable,
}

impl Source {
    pub fn new_http(key: SourceKey, name: impl Into<String>) -> Self {
        Self {
            key,
            source_type: SourceType::Http,
            name: name.into(),
            description: String::new(),
            http: Some(HttpSource::generate()),
            version: Version::default(),
            soft_delete: SoftDeletable::default(),
            switch: Switchable::default(),
        }
    }
}

impl Sink {
    pub fn new(key: SinkKey, sink_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key,
            sink_type: sink_type.into(),
            name: name.into(),
            description: String::new(),
            config: serde_json::Value::Null,
            version: Version::default(),
            soft_delete: SoftDeletable::default(),
            switch: Switchable::default(),
        }
    }
}

impl Branch {
    pub fn new(key: BranchKey, is_default: bool) -> Self {
        Self {
            key,
            is_default,
            version: Version::default(),
            soft_delete: SoftDeletable::default(),
        }
    }
}

/// Key of a definition entity.
pub trait EntityKey: Display + Clone + Send + Sync + 'static {
    /// Own identifier, without the parent segments.
    fn id(&self) -> String;

    /// String form of the parent key, e.g. `123/456` for a source.
    fn parent(&self) -> String;
}

impl EntityKey for BranchKey {
    fn id(&self) -> String {
        self.branch_id.to_string()
    }

    fn parent(&self) -> String {
        self.project_id.to_string()
    }
}

impl EntityKey for SourceKey {
    fn id(&self) -> String {
        self.source_id.to_string()
    }

    fn parent(&self) -> String {
        self.branch_key.to_string()
    }
}

impl EntityKey for SinkKey {
    fn id(&self) -> String {
        self.sink_id.to_string()
    }

    fn parent(&self) -> String {
        self.source_key.to_string()
    }
}

/// A versioned, soft-deletable entity stored by the definition repository.
pub trait DefinitionEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: EntityKey;

    /// Entity name used in keys and messages, e.g. `sink`.
    const KIND: &'static str;
    /// Name of the parent level used in messages, e.g. `source`.
    const PARENT_KIND: &'static str;

    fn key(&self) -> &Self::Key;
    fn version(&self) -> &Version;
    fn version_mut(&mut self) -> &mut Version;
    fn soft_delete(&self) -> &SoftDeletable;
    fn soft_delete_mut(&mut self) -> &mut SoftDeletable;

    /// Hash of the entity content, ignoring the version block.
    fn content_hash(&self) -> String {
        let mut content = self.clone();
        *content.version_mut() = Version::default();
        let json = serde_json::to_vec(&content).unwrap_or_default();
        let digest = Sha256::digest(&json);
        hex::encode(digest)[..16].to_string()
    }

    /// Moves the entity to the next version.
    fn increment_version(&mut self, now: DateTime<Utc>, description: impl Into<String>) {
        let hash = self.content_hash();
        let version = self.version_mut();
        version.number += 1;
        version.hash = hash;
        version.description = description.into();
        version.modified_at = now;
    }
}

/// An entity that can be disabled without deleting it.
pub trait SwitchableEntity: DefinitionEntity {
    fn switch(&self) -> &Switchable;
    fn switch_mut(&mut self) -> &mut Switchable;
}

macro_rules! impl_definition_entity {
    ($entity:ty, $key:ty, $kind:literal, $parent:literal) => {
        impl DefinitionEntity for $entity {
            type Key = $key;

            const KIND: &'static str = $kind;
            const PARENT_KIND: &'static str = $parent;

            fn key(&self) -> &Self::Key {
                &self.key
            }

            fn version(&self) -> &Version {
                &self.version
            }

            fn version_mut(&mut self) -> &mut Version {
                &mut self.version
            }

            fn soft_delete(&self) -> &SoftDeletable {
                &self.soft_delete
            }

            fn soft_delete_mut(&mut self) -> &mut SoftDeletable {
                &mut self.soft_delete
            }
        }
    };
}

impl_definition_entity!(Branch, BranchKey, "branch", "project");
impl_definition_entity!(Source, SourceKey, "source", "branch");
impl_definition_entity!(Sink, SinkKey, "sink", "source");

impl SwitchableEntity for Source {
    fn switch(&self) -> &Switchable {
        &self.switch
    }

    fn switch_mut(&mut self) -> &mut Switchable {
        &mut self.switch
    }
}

impl SwitchableEntity for Sink {
    fn switch(&self) -> &Switchable {
        &self.switch
    }

    fn switch_mut(&mut self) -> &mut Switchable {
        &mut self.switch
    }
}
