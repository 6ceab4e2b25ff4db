use crate::error::{AppError, Result};
use crate::models::{
    ConnectorCredentialPair, IndexAttempt, IndexAttemptStatus, SearchSettings, SettingsStatus,
    cc_pair::INGESTION_CC_PAIR_ID,
};
use crate::store::metadata::{
    DocumentSet, MetadataStore, StoredDocument, StoredExternalAccess, UserGroup,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// In-memory metadata store (tests and single-process deployments)
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    documents: Arc<DashMap<String, StoredDocument>>,
    document_sets: Arc<DashMap<i64, DocumentSet>>,
    user_groups: Arc<DashMap<i64, UserGroup>>,
    cc_pairs: Arc<DashMap<i64, ConnectorCredentialPair>>,
    attempts: Arc<DashMap<i64, IndexAttempt>>,
    next_attempt_id: Arc<AtomicI64>,
    /// Settings rows behind one mutex so the status invariant holds under
    /// concurrent promotion attempts
    settings: Arc<Mutex<Vec<SearchSettings>>>,
    reindex_flag: Arc<Mutex<bool>>,
    external_access: Arc<DashMap<String, StoredExternalAccess>>,
    /// `(source, group_id)` -> member emails (lowercased)
    external_groups: Arc<DashMap<(String, String), Vec<String>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            next_attempt_id: Arc::new(AtomicI64::new(1)),
            ..Default::default()
        }
    }

    fn cc_pair_ids_for_document(&self, doc_id: &str) -> Vec<i64> {
        self.documents
            .get(doc_id)
            .map(|d| d.cc_pair_ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn upsert_document(&self, doc: &StoredDocument) -> Result<()> {
        self.documents
            .insert(doc.document.id.clone(), doc.clone());
        tracing::debug!(document_id = %doc.document.id, "Document saved");
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.documents.get(id).map(|entry| entry.clone()))
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.documents.remove(id);
        self.external_access.remove(id);
        tracing::debug!(document_id = %id, "Document deleted");
        Ok(())
    }

    async fn document_ids_for_cc_pair(&self, cc_pair_id: i64) -> Result<Vec<String>> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.value().cc_pair_ids.contains(&cc_pair_id))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn count_documents_for_cc_pair(&self, cc_pair_id: i64) -> Result<u64> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.value().cc_pair_ids.contains(&cc_pair_id))
            .count() as u64)
    }

    async fn mark_document_synced(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        match self.documents.get_mut(id) {
            Some(mut entry) => {
                entry.last_synced_at = Some(at);
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Document {} not found", id))),
        }
    }

    async fn upsert_document_set(&self, set: &DocumentSet) -> Result<()> {
        self.document_sets.insert(set.id, set.clone());
        Ok(())
    }

    async fn get_document_set(&self, id: i64) -> Result<Option<DocumentSet>> {
        Ok(self.document_sets.get(&id).map(|entry| entry.clone()))
    }

    async fn document_sets_needing_sync(&self) -> Result<Vec<DocumentSet>> {
        Ok(self
            .document_sets
            .iter()
            .filter(|entry| !entry.value().is_up_to_date || entry.value().pending_deletion)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_document_set_synced(&self, id: i64) -> Result<()> {
        match self.document_sets.get_mut(&id) {
            Some(mut entry) => {
                entry.is_up_to_date = true;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Document set {} not found", id))),
        }
    }

    async fn delete_document_set(&self, id: i64) -> Result<()> {
        self.document_sets.remove(&id);
        Ok(())
    }

    async fn document_set_names_for_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let pair_ids: HashSet<i64> = self.cc_pair_ids_for_document(doc_id).into_iter().collect();
        Ok(self
            .document_sets
            .iter()
            .filter(|entry| {
                let set = entry.value();
                !set.pending_deletion && set.cc_pair_ids.iter().any(|id| pair_ids.contains(id))
            })
            .map(|entry| entry.value().name.clone())
            .collect())
    }

    async fn upsert_user_group(&self, group: &UserGroup) -> Result<()> {
        self.user_groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_user_group(&self, id: i64) -> Result<Option<UserGroup>> {
        Ok(self.user_groups.get(&id).map(|entry| entry.clone()))
    }

    async fn user_groups_needing_sync(&self) -> Result<Vec<UserGroup>> {
        Ok(self
            .user_groups
            .iter()
            .filter(|entry| !entry.value().is_up_to_date || entry.value().pending_deletion)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_user_group_synced(&self, id: i64) -> Result<()> {
        match self.user_groups.get_mut(&id) {
            Some(mut entry) => {
                entry.is_up_to_date = true;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("User group {} not found", id))),
        }
    }

    async fn delete_user_group(&self, id: i64) -> Result<()> {
        self.user_groups.remove(&id);
        Ok(())
    }

    async fn group_names_for_user(&self, email: &str) -> Result<Vec<String>> {
        let email = email.to_lowercase();
        Ok(self
            .user_groups
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .user_emails
                    .iter()
                    .any(|e| e.to_lowercase() == email)
            })
            .map(|entry| entry.value().name.clone())
            .collect())
    }

    async fn group_names_for_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let pair_ids: HashSet<i64> = self.cc_pair_ids_for_document(doc_id).into_iter().collect();
        Ok(self
            .user_groups
            .iter()
            .filter(|entry| {
                let group = entry.value();
                !group.pending_deletion
                    && group.cc_pair_ids.iter().any(|id| pair_ids.contains(id))
            })
            .map(|entry| entry.value().name.clone())
            .collect())
    }

    async fn upsert_cc_pair(&self, pair: &ConnectorCredentialPair) -> Result<()> {
        self.cc_pairs.insert(pair.id, pair.clone());
        Ok(())
    }

    async fn get_cc_pair(&self, id: i64) -> Result<Option<ConnectorCredentialPair>> {
        Ok(self.cc_pairs.get(&id).map(|entry| entry.clone()))
    }

    async fn list_cc_pairs(&self) -> Result<Vec<ConnectorCredentialPair>> {
        Ok(self
            .cc_pairs
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_cc_pair(&self, id: i64) -> Result<()> {
        self.cc_pairs.remove(&id);
        Ok(())
    }

    async fn create_index_attempt(
        &self,
        cc_pair_id: i64,
        search_settings_id: i64,
    ) -> Result<IndexAttempt> {
        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        let attempt = IndexAttempt::new(id, cc_pair_id, search_settings_id);
        self.attempts.insert(id, attempt.clone());
        Ok(attempt)
    }

    async fn update_index_attempt(&self, attempt: &IndexAttempt) -> Result<()> {
        if !self.attempts.contains_key(&attempt.id) {
            return Err(AppError::NotFound(format!(
                "Index attempt {} not found",
                attempt.id
            )));
        }
        self.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_index_attempt(&self, id: i64) -> Result<Option<IndexAttempt>> {
        Ok(self.attempts.get(&id).map(|entry| entry.clone()))
    }

    async fn count_successful_pairs_for_settings(&self, settings_id: i64) -> Result<usize> {
        let pairs: BTreeSet<i64> = self
            .attempts
            .iter()
            .filter(|entry| {
                let attempt = entry.value();
                attempt.search_settings_id == settings_id
                    && attempt.status == IndexAttemptStatus::Succeeded
                    && attempt.cc_pair_id != INGESTION_CC_PAIR_ID
            })
            .map(|entry| entry.value().cc_pair_id)
            .collect();
        Ok(pairs.len())
    }

    async fn request_cancellation_for_settings(&self, settings_id: i64) -> Result<usize> {
        let mut flagged = 0;
        for mut entry in self.attempts.iter_mut() {
            let attempt = entry.value_mut();
            if attempt.search_settings_id == settings_id && !attempt.status.is_terminal() {
                attempt.cancellation_requested = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn insert_search_settings(&self, settings: &SearchSettings) -> Result<()> {
        let mut rows = self.settings.lock();

        if rows.iter().any(|s| s.id == settings.id) {
            return Err(AppError::Validation(format!(
                "Search settings {} already exists",
                settings.id
            )));
        }
        if settings.status != SettingsStatus::Past
            && rows.iter().any(|s| s.status == settings.status)
        {
            return Err(AppError::InvalidStateTransition(format!(
                "A {} settings row already exists",
                settings.status
            )));
        }

        rows.push(settings.clone());
        Ok(())
    }

    async fn get_settings_with_status(
        &self,
        status: SettingsStatus,
    ) -> Result<Option<SearchSettings>> {
        Ok(self
            .settings
            .lock()
            .iter()
            .find(|s| s.status == status)
            .cloned())
    }

    async fn promote_future_settings(&self) -> Result<SearchSettings> {
        let mut rows = self.settings.lock();

        let future_idx = rows
            .iter()
            .position(|s| s.status == SettingsStatus::Future)
            .ok_or_else(|| AppError::NotFound("No future settings to promote".to_string()))?;

        if let Some(present) = rows.iter_mut().find(|s| s.status == SettingsStatus::Present) {
            present.status = SettingsStatus::Past;
        }
        rows[future_idx].status = SettingsStatus::Present;

        Ok(rows[future_idx].clone())
    }

    async fn set_reindex_in_progress(&self, flag: bool) -> Result<()> {
        *self.reindex_flag.lock() = flag;
        Ok(())
    }

    async fn reindex_in_progress(&self) -> Result<bool> {
        Ok(*self.reindex_flag.lock())
    }

    async fn upsert_external_access(
        &self,
        doc_id: &str,
        access: &StoredExternalAccess,
    ) -> Result<()> {
        self.external_access
            .insert(doc_id.to_string(), access.clone());
        Ok(())
    }

    async fn get_external_access(&self, doc_id: &str) -> Result<Option<StoredExternalAccess>> {
        Ok(self.external_access.get(doc_id).map(|entry| entry.clone()))
    }

    async fn upsert_external_group(
        &self,
        source: &str,
        group_id: &str,
        member_emails: &[String],
    ) -> Result<()> {
        self.external_groups.insert(
            (source.to_string(), group_id.to_string()),
            member_emails.iter().map(|e| e.to_lowercase()).collect(),
        );
        Ok(())
    }

    async fn external_groups_for_user(&self, email: &str) -> Result<Vec<(String, String)>> {
        let email = email.to_lowercase();
        Ok(self
            .external_groups
            .iter()
            .filter(|entry| entry.value().contains(&email))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
