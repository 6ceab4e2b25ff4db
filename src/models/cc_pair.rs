use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Reserved pair id for direct API ingestion; excluded from backfill
/// accounting and never scheduled for connector runs.
pub const INGESTION_CC_PAIR_ID: i64 = 0;

/// How document visibility is decided for a pair's documents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessType {
    /// Everything from this pair is public
    Public,
    /// Visibility from relational grants only
    Private,
    /// Visibility computed by an external permission-sync job; `is_public`
    /// on the relational side is ignored
    Sync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CcPairStatus {
    Active,
    Paused,
    /// Deletion requested; a fenced deletion pass will remove documents and
    /// finally the pair row itself
    Deleting,
}

/// The binding between a source connector and the credential used to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorCredentialPair {
    pub id: i64,
    pub connector_id: i64,
    pub credential_id: i64,
    pub name: String,
    pub access_type: AccessType,
    pub status: CcPairStatus,
    /// Recomputed after settings promotion and after each indexing run
    pub total_docs_indexed: u64,
    pub last_successful_index: Option<DateTime<Utc>>,
}

impl ConnectorCredentialPair {
    pub fn new(
        id: i64,
        connector_id: i64,
        credential_id: i64,
        name: impl Into<String>,
        access_type: AccessType,
    ) -> Self {
        Self {
            id,
            connector_id,
            credential_id,
            name: name.into(),
            access_type,
            status: CcPairStatus::Active,
            total_docs_indexed: 0,
            last_successful_index: None,
        }
    }

    /// Live pairs count toward backfill completeness; the synthetic
    /// ingestion pair never does.
    pub fn counts_for_backfill(&self) -> bool {
        self.id != INGESTION_CC_PAIR_ID && self.status != CcPairStatus::Deleting
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IndexAttemptStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl IndexAttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexAttemptStatus::Succeeded
                | IndexAttemptStatus::Failed
                | IndexAttemptStatus::Cancelled
        )
    }
}

/// Durable record of one indexing run of one pair against one settings
/// generation. Failures land here for operator visibility; they are never
/// surfaced as end-user search errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexAttempt {
    pub id: i64,
    pub cc_pair_id: i64,
    pub search_settings_id: i64,
    pub status: IndexAttemptStatus,
    pub error_message: Option<String>,
    pub new_docs_indexed: u64,
    pub total_docs_indexed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Soft-cancel flag, polled by the pipeline between batches
    pub cancellation_requested: bool,
}

impl IndexAttempt {
    pub fn new(id: i64, cc_pair_id: i64, search_settings_id: i64) -> Self {
        Self {
            id,
            cc_pair_id,
            search_settings_id,
            status: IndexAttemptStatus::NotStarted,
            error_message: None,
            new_docs_indexed: 0,
            total_docs_indexed: 0,
            started_at: None,
            completed_at: None,
            cancellation_requested: false,
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = IndexAttemptStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, new_docs: u64, total_docs: u64) {
        self.status = IndexAttemptStatus::Succeeded;
        self.new_docs_indexed = new_docs;
        self.total_docs_indexed = total_docs;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = IndexAttemptStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = IndexAttemptStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
