//! Sync orchestration: turn metadata-store state into fenced task batches.
//!
//! Ordering is the protocol's backbone: task ids land in the taskset first,
//! the fence is set second, tasks are dispatched last. A crash at any point
//! leaves either no fence (the next pass regenerates everything) or a fence
//! whose taskset drains normally.

use crate::connectors::ConnectorRegistry;
use crate::coordination::backend::CoordinationBackend;
use crate::coordination::keys::{FencePayload, SyncKey, SyncScope, SyncTaskId};
use crate::error::Result;
use crate::metrics::SYNC_TASKS_DISPATCHED_TOTAL;
use crate::models::{AccessType, CcPairStatus, INGESTION_CC_PAIR_ID};
use crate::store::MetadataStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One dispatched unit of sync work
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: SyncTaskId,
    pub kind: SyncTaskKind,
}

#[derive(Debug, Clone)]
pub enum SyncTaskKind {
    /// Recompute one document's index metadata (ACL tokens, set names)
    DocumentMetadataSync { document_id: String },
    /// Remove one document from the index and the metadata store
    DocumentDeletion { document_id: String },
    /// Run one connector's documents through the indexing pipeline
    ConnectorRun { cc_pair_id: i64 },
    /// Pull external permissions for one pair into the metadata store
    PermissionSync { cc_pair_id: i64 },
}

pub struct SyncOrchestrator {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn CoordinationBackend>,
    registry: Arc<ConnectorRegistry>,
    dispatcher: mpsc::UnboundedSender<SyncTask>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn CoordinationBackend>,
        registry: Arc<ConnectorRegistry>,
        dispatcher: mpsc::UnboundedSender<SyncTask>,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
            dispatcher,
        }
    }

    /// One orchestration pass over every scope.
    pub async fn orchestrate_all(&self) -> Result<()> {
        self.orchestrate_document_sets().await?;
        self.orchestrate_user_groups().await?;
        self.orchestrate_connector_indexing().await?;
        self.orchestrate_connector_deletions().await?;
        self.orchestrate_pruning().await?;
        self.orchestrate_permission_sync().await?;
        Ok(())
    }

    /// Fence one sync: taskset first, fence second, dispatch last.
    async fn fence_and_dispatch(&self, key: &SyncKey, tasks: Vec<SyncTask>) -> Result<bool> {
        if self.backend.fence_exists(key).await? {
            debug!(key = %key, "Fence already present, skipping");
            return Ok(false);
        }

        let task_ids: Vec<SyncTaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        self.backend.taskset_add(key, &task_ids).await?;
        self.backend
            .set_fence(key, &FencePayload::new(tasks.len()))
            .await?;

        let count = tasks.len();
        for task in tasks {
            SYNC_TASKS_DISPATCHED_TOTAL
                .with_label_values(&[&key.scope().to_string()])
                .inc();
            if self.dispatcher.send(task).is_err() {
                // Worker pool is gone; the fence stays and the next process
                // run picks the work back up
                warn!(key = %key, "Task dispatch channel closed");
                break;
            }
        }

        info!(key = %key, tasks = count, "Fenced sync dispatched");
        Ok(true)
    }

    /// Documents whose index metadata a set/group change invalidates
    async fn documents_for_cc_pairs(&self, cc_pair_ids: &[i64]) -> Result<BTreeSet<String>> {
        let mut doc_ids = BTreeSet::new();
        for cc_pair_id in cc_pair_ids {
            doc_ids.extend(self.store.document_ids_for_cc_pair(*cc_pair_id).await?);
        }
        Ok(doc_ids)
    }

    fn metadata_sync_tasks(key: &SyncKey, doc_ids: BTreeSet<String>) -> Vec<SyncTask> {
        doc_ids
            .into_iter()
            .map(|document_id| SyncTask {
                id: SyncTaskId::generate(key.clone()),
                kind: SyncTaskKind::DocumentMetadataSync { document_id },
            })
            .collect()
    }

    pub async fn orchestrate_document_sets(&self) -> Result<()> {
        for set in self.store.document_sets_needing_sync().await? {
            let key = SyncKey::new(SyncScope::DocumentSet, set.id.to_string())?;
            let doc_ids = self.documents_for_cc_pairs(&set.cc_pair_ids).await?;
            self.fence_and_dispatch(&key, Self::metadata_sync_tasks(&key, doc_ids))
                .await?;
        }
        Ok(())
    }

    pub async fn orchestrate_user_groups(&self) -> Result<()> {
        for group in self.store.user_groups_needing_sync().await? {
            let key = SyncKey::new(SyncScope::UserGroup, group.id.to_string())?;
            let doc_ids = self.documents_for_cc_pairs(&group.cc_pair_ids).await?;
            self.fence_and_dispatch(&key, Self::metadata_sync_tasks(&key, doc_ids))
                .await?;
        }
        Ok(())
    }

    /// One connector run per active pair. The push-based ingestion pair is
    /// fed directly through the pipeline and never scheduled here.
    pub async fn orchestrate_connector_indexing(&self) -> Result<()> {
        for pair in self.store.list_cc_pairs().await? {
            if pair.id == INGESTION_CC_PAIR_ID || pair.status != CcPairStatus::Active {
                continue;
            }
            if self.registry.connector(pair.id).is_none() {
                debug!(cc_pair_id = pair.id, "No connector registered, skipping indexing");
                continue;
            }

            let key = SyncKey::new(SyncScope::ConnectorIndexing, pair.id.to_string())?;
            let tasks = vec![SyncTask {
                id: SyncTaskId::generate(key.clone()),
                kind: SyncTaskKind::ConnectorRun { cc_pair_id: pair.id },
            }];
            self.fence_and_dispatch(&key, tasks).await?;
        }
        Ok(())
    }

    pub async fn orchestrate_connector_deletions(&self) -> Result<()> {
        for pair in self.store.list_cc_pairs().await? {
            if pair.status != CcPairStatus::Deleting {
                continue;
            }

            let key = SyncKey::new(SyncScope::ConnectorDeletion, pair.id.to_string())?;
            let tasks: Vec<SyncTask> = self
                .store
                .document_ids_for_cc_pair(pair.id)
                .await?
                .into_iter()
                .map(|document_id| SyncTask {
                    id: SyncTaskId::generate(key.clone()),
                    kind: SyncTaskKind::DocumentDeletion { document_id },
                })
                .collect();
            self.fence_and_dispatch(&key, tasks).await?;
        }
        Ok(())
    }

    /// Delete documents the source no longer has.
    pub async fn orchestrate_pruning(&self) -> Result<()> {
        for pair in self.store.list_cc_pairs().await? {
            if pair.id == INGESTION_CC_PAIR_ID || pair.status != CcPairStatus::Active {
                continue;
            }
            let Some(connector) = self.registry.connector(pair.id) else {
                continue;
            };

            let key = SyncKey::new(SyncScope::ConnectorPruning, pair.id.to_string())?;
            if self.backend.fence_exists(&key).await? {
                continue;
            }

            let current = connector.current_ids().await?;
            let tasks: Vec<SyncTask> = self
                .store
                .document_ids_for_cc_pair(pair.id)
                .await?
                .into_iter()
                .filter(|id| !current.contains(id))
                .map(|document_id| SyncTask {
                    id: SyncTaskId::generate(key.clone()),
                    kind: SyncTaskKind::DocumentDeletion { document_id },
                })
                .collect();

            if tasks.is_empty() {
                // Nothing stale; no fence needed
                continue;
            }
            self.fence_and_dispatch(&key, tasks).await?;
        }
        Ok(())
    }

    pub async fn orchestrate_permission_sync(&self) -> Result<()> {
        for pair in self.store.list_cc_pairs().await? {
            if pair.status != CcPairStatus::Active || pair.access_type != AccessType::Sync {
                continue;
            }
            if self.registry.permission_source(pair.id).is_none() {
                debug!(cc_pair_id = pair.id, "No permission source registered, skipping");
                continue;
            }

            let key = SyncKey::new(SyncScope::PermissionSync, pair.id.to_string())?;
            let tasks = vec![SyncTask {
                id: SyncTaskId::generate(key.clone()),
                kind: SyncTaskKind::PermissionSync { cc_pair_id: pair.id },
            }];
            self.fence_and_dispatch(&key, tasks).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::backend::InMemoryCoordination;
    use crate::models::{Document, DocumentSource, Section};
    use crate::store::{DocumentSet, InMemoryMetadataStore, StoredDocument};

    async fn seed_document(store: &InMemoryMetadataStore, id: &str, cc_pair_id: i64) {
        let doc = Document::new(
            id,
            DocumentSource::Web,
            id,
            vec![Section::new("body", None)],
        );
        store
            .upsert_document(&StoredDocument::new(doc, cc_pair_id))
            .await
            .unwrap();
    }

    fn orchestrator(
        store: Arc<InMemoryMetadataStore>,
        backend: Arc<InMemoryCoordination>,
    ) -> (SyncOrchestrator, mpsc::UnboundedReceiver<SyncTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SyncOrchestrator::new(store, backend, Arc::new(ConnectorRegistry::new()), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_document_set_sync_sets_taskset_then_fence() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let backend = Arc::new(InMemoryCoordination::new());

        seed_document(&store, "d1", 1).await;
        seed_document(&store, "d2", 1).await;
        store
            .upsert_document_set(&DocumentSet::new(42, "eng-docs", vec![1]))
            .await
            .unwrap();

        let (orchestrator, mut rx) = orchestrator(store, backend.clone());
        orchestrator.orchestrate_document_sets().await.unwrap();

        let key = SyncKey::new(SyncScope::DocumentSet, "42").unwrap();
        assert!(backend.fence_exists(&key).await.unwrap());
        assert_eq!(backend.taskset_len(&key).await.unwrap(), 2);
        assert_eq!(
            backend.get_fence(&key).await.unwrap().unwrap().task_count,
            2
        );

        let mut dispatched = Vec::new();
        while let Ok(task) = rx.try_recv() {
            dispatched.push(task);
        }
        assert_eq!(dispatched.len(), 2);
        assert!(dispatched
            .iter()
            .all(|t| matches!(t.kind, SyncTaskKind::DocumentMetadataSync { .. })));
    }

    #[tokio::test]
    async fn test_existing_fence_skips_regeneration() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let backend = Arc::new(InMemoryCoordination::new());

        seed_document(&store, "d1", 1).await;
        store
            .upsert_document_set(&DocumentSet::new(42, "eng-docs", vec![1]))
            .await
            .unwrap();

        let (orchestrator, mut rx) = orchestrator(store, backend.clone());
        orchestrator.orchestrate_document_sets().await.unwrap();
        // Second pass with the fence still up must not dispatch again
        orchestrator.orchestrate_document_sets().await.unwrap();

        let mut dispatched = 0;
        while rx.try_recv().is_ok() {
            dispatched += 1;
        }
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn test_ingestion_pair_never_scheduled() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let backend = Arc::new(InMemoryCoordination::new());

        store
            .upsert_cc_pair(&crate::models::ConnectorCredentialPair::new(
                INGESTION_CC_PAIR_ID,
                0,
                0,
                "ingestion",
                AccessType::Public,
            ))
            .await
            .unwrap();

        let (orchestrator, mut rx) = orchestrator(store, backend);
        orchestrator.orchestrate_connector_indexing().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleting_pair_generates_deletion_tasks() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let backend = Arc::new(InMemoryCoordination::new());

        seed_document(&store, "d1", 3).await;
        let mut pair =
            crate::models::ConnectorCredentialPair::new(3, 1, 1, "slack", AccessType::Public);
        pair.status = CcPairStatus::Deleting;
        store.upsert_cc_pair(&pair).await.unwrap();

        let (orchestrator, mut rx) = orchestrator(store, backend.clone());
        orchestrator.orchestrate_connector_deletions().await.unwrap();

        let key = SyncKey::new(SyncScope::ConnectorDeletion, "3").unwrap();
        assert!(backend.fence_exists(&key).await.unwrap());

        let task = rx.try_recv().unwrap();
        assert!(matches!(
            task.kind,
            SyncTaskKind::DocumentDeletion { ref document_id } if document_id == "d1"
        ));
    }
}
