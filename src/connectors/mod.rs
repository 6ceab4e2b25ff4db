//! Connector interfaces: where documents and external permissions come from.
//!
//! The engine never talks to source systems directly; it drives these traits.
//! `StaticConnector` is the in-process implementation used by ingestion and
//! by tests.

use crate::error::Result;
use crate::models::Document;
use crate::store::StoredExternalAccess;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// A source of documents for one connector-credential pair.
#[async_trait]
pub trait DocumentConnector: Send + Sync {
    /// Full crawl: every document the credential can see.
    async fn load_all(&self) -> Result<Vec<Document>>;

    /// Incremental crawl: documents changed inside the window.
    async fn poll(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Document>>;

    /// Ids currently present at the source, for pruning stale documents.
    async fn current_ids(&self) -> Result<HashSet<String>>;
}

/// External permission state for documents under one credential pair.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Namespace for this source's group ids, e.g. `"google_drive"`.
    fn source_name(&self) -> &str;

    /// Per-document access as the source reports it right now.
    /// Entries are `(document id, access)`.
    async fn document_permissions(&self) -> Result<Vec<(String, StoredExternalAccess)>>;

    /// Source-side group memberships as `(group id, member emails)`.
    async fn group_memberships(&self) -> Result<Vec<(String, Vec<String>)>>;
}

/// Fixed-content connector. Ingestion-API documents and tests use it; both
/// need a connector whose contents are exactly what was handed in.
#[derive(Default)]
pub struct StaticConnector {
    documents: RwLock<Vec<Document>>,
}

impl StaticConnector {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: RwLock::new(documents),
        }
    }

    pub fn set_documents(&self, documents: Vec<Document>) {
        *self.documents.write() = documents;
    }

    pub fn remove_document(&self, id: &str) {
        self.documents.write().retain(|d| d.id != id);
    }
}

#[async_trait]
impl DocumentConnector for StaticConnector {
    async fn load_all(&self) -> Result<Vec<Document>> {
        Ok(self.documents.read().clone())
    }

    async fn poll(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .read()
            .iter()
            .filter(|d| match d.updated_at {
                Some(ts) => ts >= since && ts < until,
                // Undated documents always show up in incremental runs
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn current_ids(&self) -> Result<HashSet<String>> {
        Ok(self.documents.read().iter().map(|d| d.id.clone()).collect())
    }
}

/// Fixed permission state, the `StaticConnector` of permission syncs.
pub struct StaticPermissionSource {
    source_name: String,
    permissions: RwLock<Vec<(String, StoredExternalAccess)>>,
    groups: RwLock<Vec<(String, Vec<String>)>>,
}

impl StaticPermissionSource {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            permissions: RwLock::new(Vec::new()),
            groups: RwLock::new(Vec::new()),
        }
    }

    pub fn set_document_permissions(&self, permissions: Vec<(String, StoredExternalAccess)>) {
        *self.permissions.write() = permissions;
    }

    pub fn set_group_memberships(&self, groups: Vec<(String, Vec<String>)>) {
        *self.groups.write() = groups;
    }
}

#[async_trait]
impl PermissionSource for StaticPermissionSource {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn document_permissions(&self) -> Result<Vec<(String, StoredExternalAccess)>> {
        Ok(self.permissions.read().clone())
    }

    async fn group_memberships(&self) -> Result<Vec<(String, Vec<String>)>> {
        Ok(self.groups.read().clone())
    }
}

/// Runtime registry mapping cc-pair ids to their live connector and
/// permission-source handles.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<i64, Arc<dyn DocumentConnector>>,
    permission_sources: DashMap<i64, Arc<dyn PermissionSource>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_connector(&self, cc_pair_id: i64, connector: Arc<dyn DocumentConnector>) {
        self.connectors.insert(cc_pair_id, connector);
    }

    pub fn register_permission_source(
        &self,
        cc_pair_id: i64,
        source: Arc<dyn PermissionSource>,
    ) {
        self.permission_sources.insert(cc_pair_id, source);
    }

    pub fn connector(&self, cc_pair_id: i64) -> Option<Arc<dyn DocumentConnector>> {
        self.connectors.get(&cc_pair_id).map(|e| e.clone())
    }

    pub fn permission_source(&self, cc_pair_id: i64) -> Option<Arc<dyn PermissionSource>> {
        self.permission_sources.get(&cc_pair_id).map(|e| e.clone())
    }

    pub fn deregister(&self, cc_pair_id: i64) {
        self.connectors.remove(&cc_pair_id);
        self.permission_sources.remove(&cc_pair_id);
    }
}
