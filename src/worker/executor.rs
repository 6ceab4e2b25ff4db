//! Execution of individual sync tasks.

use crate::access::AccessResolver;
use crate::connectors::ConnectorRegistry;
use crate::coordination::{SyncTask, SyncTaskKind};
use crate::error::{AppError, Result};
use crate::index::{DocumentIndex, UpdateRequest};
use crate::indexing::IndexingPipeline;
use crate::models::SettingsStatus;
use crate::store::MetadataStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs one `SyncTask` to completion.
///
/// Every handler is idempotent: tasks are delivered at least once, and a
/// task re-run after a crash must converge on the same end state.
pub struct SyncTaskExecutor {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn DocumentIndex>,
    resolver: AccessResolver,
    registry: Arc<ConnectorRegistry>,
    pipeline: Arc<IndexingPipeline>,
}

impl SyncTaskExecutor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn DocumentIndex>,
        registry: Arc<ConnectorRegistry>,
        pipeline: Arc<IndexingPipeline>,
    ) -> Self {
        Self {
            resolver: AccessResolver::new(store.clone()),
            store,
            index,
            registry,
            pipeline,
        }
    }

    pub async fn execute(&self, task: &SyncTask) -> Result<()> {
        match &task.kind {
            SyncTaskKind::DocumentMetadataSync { document_id } => {
                self.sync_document_metadata(document_id).await
            }
            SyncTaskKind::DocumentDeletion { document_id } => {
                self.delete_document(document_id).await
            }
            SyncTaskKind::ConnectorRun { cc_pair_id } => self.run_connector(*cc_pair_id).await,
            SyncTaskKind::PermissionSync { cc_pair_id } => {
                self.sync_permissions(*cc_pair_id).await
            }
        }
    }

    /// Recompute one document's derived index fields without re-embedding.
    async fn sync_document_metadata(&self, document_id: &str) -> Result<()> {
        let access = self.resolver.for_document(document_id).await?;
        let document_sets = self
            .store
            .document_set_names_for_document(document_id)
            .await?;

        let mut request = UpdateRequest::for_document(document_id)
            .with_acl(access.to_acl_tokens())
            .with_document_sets(document_sets);
        if let Some(stored) = self.store.get_document(document_id).await? {
            request = request.with_boost(stored.boost).with_hidden(stored.hidden);
        }

        self.index.update(std::slice::from_ref(&request)).await?;
        self.store
            .mark_document_synced(document_id, Utc::now())
            .await?;
        debug!(document_id, "Document metadata synced");
        Ok(())
    }

    /// Index first, then the store row; a crash in between leaves a row
    /// that a re-run deletes cleanly.
    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.index.delete(&[document_id.to_string()]).await?;
        self.store.delete_document(document_id).await?;
        debug!(document_id, "Document deleted");
        Ok(())
    }

    /// Run one connector's documents through the pipeline under a fresh
    /// index attempt.
    async fn run_connector(&self, cc_pair_id: i64) -> Result<()> {
        let connector = self
            .registry
            .connector(cc_pair_id)
            .ok_or_else(|| AppError::NotFound(format!("Connector for pair {}", cc_pair_id)))?;
        let mut pair = self
            .store
            .get_cc_pair(cc_pair_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connector pair {}", cc_pair_id)))?;
        let settings = self
            .store
            .get_settings_with_status(SettingsStatus::Present)
            .await?
            .ok_or_else(|| {
                AppError::InvalidStateTransition(
                    "Connector run with no PRESENT search settings".to_string(),
                )
            })?;

        let mut attempt = self.store.create_index_attempt(pair.id, settings.id).await?;
        attempt.mark_in_progress();
        self.store.update_index_attempt(&attempt).await?;

        // Full crawl on the first run, incremental afterwards
        let documents = match pair.last_successful_index {
            Some(since) => connector.poll(since, Utc::now()).await?,
            None => connector.load_all().await?,
        };

        match self
            .pipeline
            .index_documents(&documents, pair.id, Some(attempt.id), None)
            .await
        {
            Ok(stats) => {
                attempt.mark_succeeded(stats.new_docs, stats.total_docs);
                self.store.update_index_attempt(&attempt).await?;

                pair.last_successful_index = Some(Utc::now());
                pair.total_docs_indexed =
                    self.store.count_documents_for_cc_pair(pair.id).await?;
                self.store.upsert_cc_pair(&pair).await?;

                info!(
                    cc_pair_id,
                    attempt_id = attempt.id,
                    total_docs = stats.total_docs,
                    "Connector run succeeded"
                );
                Ok(())
            }
            // The pipeline already marked the attempt cancelled; the task
            // itself completed normally
            Err(AppError::Cancelled(reason)) => {
                info!(cc_pair_id, attempt_id = attempt.id, %reason, "Connector run cancelled");
                Ok(())
            }
            Err(e) => {
                attempt.mark_failed(e.to_string());
                self.store.update_index_attempt(&attempt).await?;
                Err(e)
            }
        }
    }

    /// Pull external permissions into the store, then push the recomputed
    /// ACL tokens into the index.
    async fn sync_permissions(&self, cc_pair_id: i64) -> Result<()> {
        let source = self.registry.permission_source(cc_pair_id).ok_or_else(|| {
            AppError::NotFound(format!("Permission source for pair {}", cc_pair_id))
        })?;

        for (group_id, members) in source.group_memberships().await? {
            self.store
                .upsert_external_group(source.source_name(), &group_id, &members)
                .await?;
        }

        let mut requests = Vec::new();
        for (doc_id, access) in source.document_permissions().await? {
            self.store.upsert_external_access(&doc_id, &access).await?;
            let resolved = self.resolver.for_document(&doc_id).await?;
            requests.push(UpdateRequest::for_document(&doc_id).with_acl(resolved.to_acl_tokens()));
        }

        if !requests.is_empty() {
            self.index.update(&requests).await?;
        }
        info!(cc_pair_id, documents = requests.len(), "Permissions synced");
        Ok(())
    }
}
