//! Fence monitoring: detect drained tasksets and finalize their syncs.
//!
//! `tick` re-evaluates every live fence from scratch, so a crash between
//! finalization and fence deletion is repaired on the next tick: finalizing
//! an already-finalized object is a no-op for every scope. A fence whose
//! taskset has not drained within the stale timeout is cleared the same way,
//! so a task failure leaves the object eligible for re-orchestration instead
//! of wedged behind its own fence.

use crate::connectors::ConnectorRegistry;
use crate::coordination::backend::CoordinationBackend;
use crate::coordination::keys::{SyncKey, SyncScope};
use crate::error::{AppError, Result};
use crate::metrics::{SYNC_FINALIZATIONS_TOTAL, SYNC_STALE_FENCES_CLEARED_TOTAL};
use crate::store::MetadataStore;
use chrono::Utc;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

pub struct SyncMonitor {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn CoordinationBackend>,
    registry: Arc<ConnectorRegistry>,
    stale_after: chrono::Duration,
}

impl SyncMonitor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn CoordinationBackend>,
        registry: Arc<ConnectorRegistry>,
        stale_fence_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
            stale_after: chrono::Duration::seconds(stale_fence_timeout_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Scan every scope and finalize each fence whose taskset has drained.
    /// Returns the number of syncs finalized.
    pub async fn tick(&self) -> Result<usize> {
        let mut finalized = 0;

        for scope in SyncScope::iter() {
            for key in self.backend.list_fences(scope).await? {
                let outstanding = self.backend.taskset_len(&key).await?;
                if outstanding > 0 {
                    self.clear_if_stale(&key, outstanding).await?;
                    continue;
                }

                match self.finalize(&key).await {
                    Ok(()) => {
                        self.backend.clear_sync(&key).await?;
                        SYNC_FINALIZATIONS_TOTAL
                            .with_label_values(&[&scope.to_string()])
                            .inc();
                        info!(key = %key, "Sync finalized");
                        finalized += 1;
                    }
                    Err(e) => {
                        // Leave the fence; the next tick retries
                        warn!(key = %key, error = %e, "Finalization failed");
                    }
                }
            }
        }

        Ok(finalized)
    }

    /// Clear a fence whose taskset stopped draining. Leftover task ids mean a
    /// worker failed or died mid-sync; dropping the fence and taskset lets the
    /// next orchestration pass regenerate and re-dispatch the whole batch,
    /// which is safe because every task is idempotent.
    async fn clear_if_stale(&self, key: &SyncKey, outstanding: usize) -> Result<()> {
        let Some(fence) = self.backend.get_fence(key).await? else {
            return Ok(());
        };
        let age = Utc::now() - fence.set_at;
        if age <= self.stale_after {
            debug!(key = %key, outstanding, "Sync still draining");
            return Ok(());
        }

        warn!(
            key = %key,
            outstanding,
            age_secs = age.num_seconds(),
            "Fence stalled past the stale timeout, clearing for re-orchestration"
        );
        self.backend.clear_sync(key).await?;
        SYNC_STALE_FENCES_CLEARED_TOTAL
            .with_label_values(&[&key.scope().to_string()])
            .inc();
        Ok(())
    }

    async fn finalize(&self, key: &SyncKey) -> Result<()> {
        match key.scope() {
            SyncScope::DocumentSet => self.finalize_document_set(key).await,
            SyncScope::UserGroup => self.finalize_user_group(key).await,
            SyncScope::ConnectorDeletion => self.finalize_connector_deletion(key).await,
            // Indexing, pruning, and permission sync carry no object state
            // beyond what their tasks already wrote
            SyncScope::ConnectorIndexing
            | SyncScope::ConnectorPruning
            | SyncScope::PermissionSync => Ok(()),
        }
    }

    fn object_id_i64(key: &SyncKey) -> Result<i64> {
        key.object_id()
            .parse()
            .map_err(|_| AppError::Validation(format!("Non-numeric sync object id: {}", key)))
    }

    async fn finalize_document_set(&self, key: &SyncKey) -> Result<()> {
        let id = Self::object_id_i64(key)?;
        match self.store.get_document_set(id).await? {
            Some(set) if set.pending_deletion => self.store.delete_document_set(id).await,
            Some(_) => self.store.mark_document_set_synced(id).await,
            // Already gone; nothing left to do
            None => Ok(()),
        }
    }

    async fn finalize_user_group(&self, key: &SyncKey) -> Result<()> {
        let id = Self::object_id_i64(key)?;
        match self.store.get_user_group(id).await? {
            Some(group) if group.pending_deletion => self.store.delete_user_group(id).await,
            Some(_) => self.store.mark_user_group_synced(id).await,
            None => Ok(()),
        }
    }

    /// Every document task has run; remove the pair row itself.
    async fn finalize_connector_deletion(&self, key: &SyncKey) -> Result<()> {
        let id = Self::object_id_i64(key)?;
        if self.store.get_cc_pair(id).await?.is_some() {
            self.store.delete_cc_pair(id).await?;
        }
        self.registry.deregister(id);
        Ok(())
    }
}
