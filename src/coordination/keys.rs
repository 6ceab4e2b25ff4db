//! Typed coordination keys.
//!
//! Keys are rendered with `/` between components and object ids may not
//! contain `/`, so every rendered key and task id parses back unambiguously.
//! Nothing in the system splits keys on heuristics.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// The six kinds of background synchronization this engine coordinates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum SyncScope {
    DocumentSet,
    UserGroup,
    ConnectorIndexing,
    ConnectorDeletion,
    ConnectorPruning,
    PermissionSync,
}

/// Identifies one synchronization: a scope plus the id of the object being
/// synced (document set id, user group id, cc-pair id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncKey {
    scope: SyncScope,
    object_id: String,
}

impl SyncKey {
    pub fn new(scope: SyncScope, object_id: impl Into<String>) -> Result<Self> {
        let object_id = object_id.into();
        if object_id.is_empty() {
            return Err(AppError::Validation("Sync object id must not be empty".to_string()));
        }
        if object_id.contains('/') {
            return Err(AppError::Validation(format!(
                "Sync object id must not contain '/': {}",
                object_id
            )));
        }
        Ok(Self { scope, object_id })
    }

    pub fn scope(&self) -> SyncScope {
        self.scope
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Redis key holding the fence payload for this sync
    pub fn fence_key(&self) -> String {
        format!("sync/{}/fence/{}", self.scope, self.object_id)
    }

    /// Redis key of the set of outstanding task ids for this sync
    pub fn taskset_key(&self) -> String {
        format!("sync/{}/taskset/{}", self.scope, self.object_id)
    }

    /// Parse an object key back out of a rendered fence key.
    pub fn from_fence_key(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        let (Some("sync"), Some(scope), Some("fence"), Some(object_id), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(AppError::Validation(format!("Malformed fence key: {}", key)));
        };

        let scope: SyncScope = scope
            .parse()
            .map_err(|_| AppError::Validation(format!("Unknown sync scope in key: {}", key)))?;
        Self::new(scope, object_id)
    }

    /// Pattern matching every fence key in a scope
    pub fn fence_pattern(scope: SyncScope) -> String {
        format!("sync/{}/fence/*", scope)
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.object_id)
    }
}

/// One dispatched unit of work inside a sync, unique per generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTaskId {
    key: SyncKey,
    uuid: Uuid,
}

impl SyncTaskId {
    pub fn generate(key: SyncKey) -> Self {
        Self {
            key,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn key(&self) -> &SyncKey {
        &self.key
    }

    pub fn render(&self) -> String {
        format!("{}/{}/{}", self.key.scope, self.key.object_id, self.uuid)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split('/');
        let (Some(scope), Some(object_id), Some(uuid), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AppError::Validation(format!("Malformed sync task id: {}", raw)));
        };

        let scope: SyncScope = scope
            .parse()
            .map_err(|_| AppError::Validation(format!("Unknown sync scope in task id: {}", raw)))?;
        let uuid = Uuid::parse_str(uuid)
            .map_err(|_| AppError::Validation(format!("Malformed uuid in task id: {}", raw)))?;

        Ok(Self {
            key: SyncKey::new(scope, object_id)?,
            uuid,
        })
    }
}

impl fmt::Display for SyncTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Value stored under a fence key while a sync is in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencePayload {
    /// Tasks generated for this sync when the fence was set
    pub task_count: usize,
    pub set_at: chrono::DateTime<chrono::Utc>,
}

impl FencePayload {
    pub fn new(task_count: usize) -> Self {
        Self {
            task_count,
            set_at: chrono::Utc::now(),
        }
    }
}
