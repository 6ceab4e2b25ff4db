use crate::error::Result;
use crate::models::{
    ConnectorCredentialPair, Document, IndexAttempt, SearchSettings, SettingsStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A document row: the connector-emitted document plus the relational fields
/// the index derives partial updates from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document: Document,
    pub boost: i32,
    pub hidden: bool,
    /// Pairs this document was discovered through
    pub cc_pair_ids: Vec<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl StoredDocument {
    pub fn new(document: Document, cc_pair_id: i64) -> Self {
        Self {
            document,
            boost: 0,
            hidden: false,
            cc_pair_ids: vec![cc_pair_id],
            last_synced_at: None,
        }
    }
}

/// A curated collection of connector-credential pairs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSet {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub cc_pair_ids: Vec<i64>,
    /// Cleared whenever membership changes; restored by the sync monitor
    pub is_up_to_date: bool,
    pub pending_deletion: bool,
}

impl DocumentSet {
    pub fn new(id: i64, name: impl Into<String>, cc_pair_ids: Vec<i64>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            cc_pair_ids,
            is_up_to_date: false,
            pending_deletion: false,
        }
    }
}

/// An internal user group / teamspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroup {
    pub id: i64,
    pub name: String,
    pub user_emails: Vec<String>,
    /// Pairs whose documents are visible to this group
    pub cc_pair_ids: Vec<i64>,
    pub is_up_to_date: bool,
    pub pending_deletion: bool,
}

impl UserGroup {
    pub fn new(id: i64, name: impl Into<String>, user_emails: Vec<String>) -> Self {
        Self {
            id,
            name: name.into(),
            user_emails,
            cc_pair_ids: Vec::new(),
            is_up_to_date: false,
            pending_deletion: false,
        }
    }
}

/// Externally-synced per-document permissions, as written by a
/// permission-sync job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredExternalAccess {
    pub external_user_emails: BTreeSet<String>,
    /// `(source, group_id)` pairs
    pub external_user_group_ids: BTreeSet<(String, String)>,
    pub is_public: bool,
}

/// The relational source-of-truth behind the search index.
///
/// The only durably shared mutable resource in the system; everything the
/// index holds can be rebuilt from here.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ---- documents ----
    async fn upsert_document(&self, doc: &StoredDocument) -> Result<()>;
    async fn get_document(&self, id: &str) -> Result<Option<StoredDocument>>;
    async fn delete_document(&self, id: &str) -> Result<()>;
    async fn document_ids_for_cc_pair(&self, cc_pair_id: i64) -> Result<Vec<String>>;
    async fn count_documents_for_cc_pair(&self, cc_pair_id: i64) -> Result<u64>;
    async fn mark_document_synced(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    // ---- document sets ----
    async fn upsert_document_set(&self, set: &DocumentSet) -> Result<()>;
    async fn get_document_set(&self, id: i64) -> Result<Option<DocumentSet>>;
    async fn document_sets_needing_sync(&self) -> Result<Vec<DocumentSet>>;
    async fn mark_document_set_synced(&self, id: i64) -> Result<()>;
    async fn delete_document_set(&self, id: i64) -> Result<()>;
    /// Names of every set whose pair membership covers this document
    async fn document_set_names_for_document(&self, doc_id: &str) -> Result<Vec<String>>;

    // ---- user groups ----
    async fn upsert_user_group(&self, group: &UserGroup) -> Result<()>;
    async fn get_user_group(&self, id: i64) -> Result<Option<UserGroup>>;
    async fn user_groups_needing_sync(&self) -> Result<Vec<UserGroup>>;
    async fn mark_user_group_synced(&self, id: i64) -> Result<()>;
    async fn delete_user_group(&self, id: i64) -> Result<()>;
    async fn group_names_for_user(&self, email: &str) -> Result<Vec<String>>;
    async fn group_names_for_document(&self, doc_id: &str) -> Result<Vec<String>>;

    // ---- connector-credential pairs ----
    async fn upsert_cc_pair(&self, pair: &ConnectorCredentialPair) -> Result<()>;
    async fn get_cc_pair(&self, id: i64) -> Result<Option<ConnectorCredentialPair>>;
    async fn list_cc_pairs(&self) -> Result<Vec<ConnectorCredentialPair>>;
    async fn delete_cc_pair(&self, id: i64) -> Result<()>;

    // ---- index attempts ----
    async fn create_index_attempt(
        &self,
        cc_pair_id: i64,
        search_settings_id: i64,
    ) -> Result<IndexAttempt>;
    async fn update_index_attempt(&self, attempt: &IndexAttempt) -> Result<()>;
    async fn get_index_attempt(&self, id: i64) -> Result<Option<IndexAttempt>>;
    /// Distinct live pairs with a successful attempt against this settings
    /// generation; the backfill-completeness input
    async fn count_successful_pairs_for_settings(&self, settings_id: i64) -> Result<usize>;
    /// Soft-cancel every non-terminal attempt pinned to this generation.
    /// Returns how many attempts were flagged.
    async fn request_cancellation_for_settings(&self, settings_id: i64) -> Result<usize>;

    // ---- search settings ----
    /// Insert a settings row. Rejects a second `Present` or a second
    /// `Future` row, mirroring the partial-unique-index invariant.
    async fn insert_search_settings(&self, settings: &SearchSettings) -> Result<()>;
    async fn get_settings_with_status(
        &self,
        status: SettingsStatus,
    ) -> Result<Option<SearchSettings>>;
    /// Guarded swap: the `Future` row becomes `Present` and the old
    /// `Present` becomes `Past`, as a single atomic transition. Errors with
    /// `NotFound` when no `Future` row exists, which makes a duplicate
    /// promotion attempt a no-op for the caller.
    async fn promote_future_settings(&self) -> Result<SearchSettings>;
    async fn set_reindex_in_progress(&self, flag: bool) -> Result<()>;
    async fn reindex_in_progress(&self) -> Result<bool>;

    // ---- externally-synced permissions ----
    async fn upsert_external_access(
        &self,
        doc_id: &str,
        access: &StoredExternalAccess,
    ) -> Result<()>;
    async fn get_external_access(&self, doc_id: &str) -> Result<Option<StoredExternalAccess>>;
    async fn upsert_external_group(
        &self,
        source: &str,
        group_id: &str,
        member_emails: &[String],
    ) -> Result<()>;
    async fn external_groups_for_user(&self, email: &str) -> Result<Vec<(String, String)>>;
}
