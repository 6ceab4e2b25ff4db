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
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Persistent metadata store using the Sled embedded database
#[derive(Clone)]
pub struct SledMetadataStore {
    db: Arc<Db>,
    documents: sled::Tree,
    document_sets: sled::Tree,
    user_groups: sled::Tree,
    cc_pairs: sled::Tree,
    attempts: sled::Tree,
    settings: sled::Tree,
    external_access: sled::Tree,
    external_groups: sled::Tree,
    meta: sled::Tree,
    /// Serializes settings-table mutations so the single-PRESENT invariant
    /// holds without multi-key transactions
    settings_guard: Arc<Mutex<()>>,
}

impl SledMetadataStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(&path)
            .map_err(|e| AppError::Store(format!("Failed to open sled database: {}", e)))?;

        let open = |name: &str| -> Result<sled::Tree> {
            db.open_tree(name)
                .map_err(|e| AppError::Store(format!("Failed to open tree {}: {}", name, e)))
        };

        let store = Self {
            documents: open("documents")?,
            document_sets: open("document_sets")?,
            user_groups: open("user_groups")?,
            cc_pairs: open("cc_pairs")?,
            attempts: open("index_attempts")?,
            settings: open("search_settings")?,
            external_access: open("external_access")?,
            external_groups: open("external_groups")?,
            meta: open("meta")?,
            db: Arc::new(db),
            settings_guard: Arc::new(Mutex::new(())),
        };

        tracing::info!(path = %path.as_ref().display(), "Initialized sled metadata store");
        Ok(store)
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| AppError::Serialization(format!("Failed to encode value: {}", e)))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes)
            .map_err(|e| AppError::Serialization(format!("Failed to decode value: {}", e)))
    }

    fn i64_key(id: i64) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn get_typed<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry?;
            values.push(Self::decode(&bytes)?);
        }
        Ok(values)
    }

    fn cc_pair_ids_for_document(&self, doc_id: &str) -> Result<HashSet<i64>> {
        Ok(
            Self::get_typed::<StoredDocument>(&self.documents, doc_id.as_bytes())?
                .map(|d| d.cc_pair_ids.into_iter().collect())
                .unwrap_or_default(),
        )
    }

    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| AppError::Store(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SledMetadataStore {
    async fn upsert_document(&self, doc: &StoredDocument) -> Result<()> {
        self.documents
            .insert(doc.document.id.as_bytes(), Self::encode(doc)?)?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<StoredDocument>> {
        Self::get_typed(&self.documents, id.as_bytes())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.documents.remove(id.as_bytes())?;
        self.external_access.remove(id.as_bytes())?;
        Ok(())
    }

    async fn document_ids_for_cc_pair(&self, cc_pair_id: i64) -> Result<Vec<String>> {
        Ok(Self::scan::<StoredDocument>(&self.documents)?
            .into_iter()
            .filter(|d| d.cc_pair_ids.contains(&cc_pair_id))
            .map(|d| d.document.id)
            .collect())
    }

    async fn count_documents_for_cc_pair(&self, cc_pair_id: i64) -> Result<u64> {
        Ok(self.document_ids_for_cc_pair(cc_pair_id).await?.len() as u64)
    }

    async fn mark_document_synced(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut doc = self
            .get_document(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Document {} not found", id)))?;
        doc.last_synced_at = Some(at);
        self.upsert_document(&doc).await
    }

    async fn upsert_document_set(&self, set: &DocumentSet) -> Result<()> {
        self.document_sets
            .insert(Self::i64_key(set.id), Self::encode(set)?)?;
        Ok(())
    }

    async fn get_document_set(&self, id: i64) -> Result<Option<DocumentSet>> {
        Self::get_typed(&self.document_sets, &Self::i64_key(id))
    }

    async fn document_sets_needing_sync(&self) -> Result<Vec<DocumentSet>> {
        Ok(Self::scan::<DocumentSet>(&self.document_sets)?
            .into_iter()
            .filter(|s| !s.is_up_to_date || s.pending_deletion)
            .collect())
    }

    async fn mark_document_set_synced(&self, id: i64) -> Result<()> {
        let mut set = self
            .get_document_set(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Document set {} not found", id)))?;
        set.is_up_to_date = true;
        self.upsert_document_set(&set).await
    }

    async fn delete_document_set(&self, id: i64) -> Result<()> {
        self.document_sets.remove(Self::i64_key(id))?;
        Ok(())
    }

    async fn document_set_names_for_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let pair_ids = self.cc_pair_ids_for_document(doc_id)?;
        Ok(Self::scan::<DocumentSet>(&self.document_sets)?
            .into_iter()
            .filter(|s| {
                !s.pending_deletion && s.cc_pair_ids.iter().any(|id| pair_ids.contains(id))
            })
            .map(|s| s.name)
            .collect())
    }

    async fn upsert_user_group(&self, group: &UserGroup) -> Result<()> {
        self.user_groups
            .insert(Self::i64_key(group.id), Self::encode(group)?)?;
        Ok(())
    }

    async fn get_user_group(&self, id: i64) -> Result<Option<UserGroup>> {
        Self::get_typed(&self.user_groups, &Self::i64_key(id))
    }

    async fn user_groups_needing_sync(&self) -> Result<Vec<UserGroup>> {
        Ok(Self::scan::<UserGroup>(&self.user_groups)?
            .into_iter()
            .filter(|g| !g.is_up_to_date || g.pending_deletion)
            .collect())
    }

    async fn mark_user_group_synced(&self, id: i64) -> Result<()> {
        let mut group = self
            .get_user_group(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User group {} not found", id)))?;
        group.is_up_to_date = true;
        self.upsert_user_group(&group).await
    }

    async fn delete_user_group(&self, id: i64) -> Result<()> {
        self.user_groups.remove(Self::i64_key(id))?;
        Ok(())
    }

    async fn group_names_for_user(&self, email: &str) -> Result<Vec<String>> {
        let email = email.to_lowercase();
        Ok(Self::scan::<UserGroup>(&self.user_groups)?
            .into_iter()
            .filter(|g| g.user_emails.iter().any(|e| e.to_lowercase() == email))
            .map(|g| g.name)
            .collect())
    }

    async fn group_names_for_document(&self, doc_id: &str) -> Result<Vec<String>> {
        let pair_ids = self.cc_pair_ids_for_document(doc_id)?;
        Ok(Self::scan::<UserGroup>(&self.user_groups)?
            .into_iter()
            .filter(|g| {
                !g.pending_deletion && g.cc_pair_ids.iter().any(|id| pair_ids.contains(id))
            })
            .map(|g| g.name)
            .collect())
    }

    async fn upsert_cc_pair(&self, pair: &ConnectorCredentialPair) -> Result<()> {
        self.cc_pairs
            .insert(Self::i64_key(pair.id), Self::encode(pair)?)?;
        Ok(())
    }

    async fn get_cc_pair(&self, id: i64) -> Result<Option<ConnectorCredentialPair>> {
        Self::get_typed(&self.cc_pairs, &Self::i64_key(id))
    }

    async fn list_cc_pairs(&self) -> Result<Vec<ConnectorCredentialPair>> {
        Self::scan(&self.cc_pairs)
    }

    async fn delete_cc_pair(&self, id: i64) -> Result<()> {
        self.cc_pairs.remove(Self::i64_key(id))?;
        Ok(())
    }

    async fn create_index_attempt(
        &self,
        cc_pair_id: i64,
        search_settings_id: i64,
    ) -> Result<IndexAttempt> {
        let id = self.db.generate_id()? as i64;
        let attempt = IndexAttempt::new(id, cc_pair_id, search_settings_id);
        self.attempts
            .insert(Self::i64_key(id), Self::encode(&attempt)?)?;
        Ok(attempt)
    }

    async fn update_index_attempt(&self, attempt: &IndexAttempt) -> Result<()> {
        if self.attempts.get(Self::i64_key(attempt.id))?.is_none() {
            return Err(AppError::NotFound(format!(
                "Index attempt {} not found",
                attempt.id
            )));
        }
        self.attempts
            .insert(Self::i64_key(attempt.id), Self::encode(attempt)?)?;
        Ok(())
    }

    async fn get_index_attempt(&self, id: i64) -> Result<Option<IndexAttempt>> {
        Self::get_typed(&self.attempts, &Self::i64_key(id))
    }

    async fn count_successful_pairs_for_settings(&self, settings_id: i64) -> Result<usize> {
        let pairs: BTreeSet<i64> = Self::scan::<IndexAttempt>(&self.attempts)?
            .into_iter()
            .filter(|a| {
                a.search_settings_id == settings_id
                    && a.status == IndexAttemptStatus::Succeeded
                    && a.cc_pair_id != INGESTION_CC_PAIR_ID
            })
            .map(|a| a.cc_pair_id)
            .collect();
        Ok(pairs.len())
    }

    async fn request_cancellation_for_settings(&self, settings_id: i64) -> Result<usize> {
        let mut flagged = 0;
        for mut attempt in Self::scan::<IndexAttempt>(&self.attempts)? {
            if attempt.search_settings_id == settings_id && !attempt.status.is_terminal() {
                attempt.cancellation_requested = true;
                self.attempts
                    .insert(Self::i64_key(attempt.id), Self::encode(&attempt)?)?;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn insert_search_settings(&self, settings: &SearchSettings) -> Result<()> {
        let _guard = self.settings_guard.lock();

        if self.settings.get(Self::i64_key(settings.id))?.is_some() {
            return Err(AppError::Validation(format!(
                "Search settings {} already exists",
                settings.id
            )));
        }
        if settings.status != SettingsStatus::Past {
            let conflict = Self::scan::<SearchSettings>(&self.settings)?
                .into_iter()
                .any(|s| s.status == settings.status);
            if conflict {
                return Err(AppError::InvalidStateTransition(format!(
                    "A {} settings row already exists",
                    settings.status
                )));
            }
        }

        self.settings
            .insert(Self::i64_key(settings.id), Self::encode(settings)?)?;
        Ok(())
    }

    async fn get_settings_with_status(
        &self,
        status: SettingsStatus,
    ) -> Result<Option<SearchSettings>> {
        Ok(Self::scan::<SearchSettings>(&self.settings)?
            .into_iter()
            .find(|s| s.status == status))
    }

    async fn promote_future_settings(&self) -> Result<SearchSettings> {
        let _guard = self.settings_guard.lock();

        let rows = Self::scan::<SearchSettings>(&self.settings)?;
        let mut future = rows
            .iter()
            .find(|s| s.status == SettingsStatus::Future)
            .cloned()
            .ok_or_else(|| AppError::NotFound("No future settings to promote".to_string()))?;

        if let Some(mut present) = rows
            .into_iter()
            .find(|s| s.status == SettingsStatus::Present)
        {
            present.status = SettingsStatus::Past;
            self.settings
                .insert(Self::i64_key(present.id), Self::encode(&present)?)?;
        }

        future.status = SettingsStatus::Present;
        self.settings
            .insert(Self::i64_key(future.id), Self::encode(&future)?)?;

        Ok(future)
    }

    async fn set_reindex_in_progress(&self, flag: bool) -> Result<()> {
        self.meta.insert(b"reindex_in_progress", vec![flag as u8])?;
        Ok(())
    }

    async fn reindex_in_progress(&self) -> Result<bool> {
        Ok(self
            .meta
            .get(b"reindex_in_progress")?
            .map(|bytes| bytes.first() == Some(&1))
            .unwrap_or(false))
    }

    async fn upsert_external_access(
        &self,
        doc_id: &str,
        access: &StoredExternalAccess,
    ) -> Result<()> {
        self.external_access
            .insert(doc_id.as_bytes(), Self::encode(access)?)?;
        Ok(())
    }

    async fn get_external_access(&self, doc_id: &str) -> Result<Option<StoredExternalAccess>> {
        Self::get_typed(&self.external_access, doc_id.as_bytes())
    }

    async fn upsert_external_group(
        &self,
        source: &str,
        group_id: &str,
        member_emails: &[String],
    ) -> Result<()> {
        let key = format!("{}\u{1f}{}", source, group_id);
        let members: Vec<String> = member_emails.iter().map(|e| e.to_lowercase()).collect();
        self.external_groups
            .insert(key.as_bytes(), Self::encode(&members)?)?;
        Ok(())
    }

    async fn external_groups_for_user(&self, email: &str) -> Result<Vec<(String, String)>> {
        let email = email.to_lowercase();
        let mut groups = Vec::new();
        for entry in self.external_groups.iter() {
            let (key, bytes) = entry?;
            let members: Vec<String> = Self::decode(&bytes)?;
            if members.contains(&email) {
                let key_str = String::from_utf8_lossy(&key);
                if let Some((source, group_id)) = key_str.split_once('\u{1f}') {
                    groups.push((source.to_string(), group_id.to_string()));
                }
            }
        }
        Ok(groups)
    }
}
