//! Search-settings generation management.
//!
//! A new embedding generation enters as a FUTURE row while backfill attempts
//! run against it pair by pair. Once every live pair has a successful
//! attempt, the generations swap: PRESENT becomes PAST, FUTURE becomes
//! PRESENT. The store's guarded swap is the only way status changes, so a
//! concurrent duplicate promotion loses the race and becomes a no-op.

use crate::error::{AppError, Result};
use crate::metrics::REINDEX_IN_PROGRESS;
use crate::models::{NewGenerationParams, SearchSettings, SettingsStatus};
use crate::store::MetadataStore;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SwapManager {
    store: Arc<dyn MetadataStore>,
}

impl SwapManager {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Create the PRESENT generation if none exists yet. First-boot path.
    pub async fn ensure_present(&self, params: &NewGenerationParams) -> Result<SearchSettings> {
        if let Some(present) = self
            .store
            .get_settings_with_status(SettingsStatus::Present)
            .await?
        {
            return Ok(present);
        }

        let mut settings = SearchSettings::new(
            1,
            &params.index_name,
            SettingsStatus::Present,
            &params.model_name,
            params.model_dimension,
        );
        settings.query_prefix = params.query_prefix.clone();
        settings.passage_prefix = params.passage_prefix.clone();

        self.store.insert_search_settings(&settings).await?;
        info!(settings_id = settings.id, model = %settings.model_name, "Created initial search settings");
        Ok(settings)
    }

    /// Register a FUTURE generation and flag the reindex as in progress.
    /// Errors if a generation swap is already underway.
    pub async fn request_new_generation(
        &self,
        params: &NewGenerationParams,
    ) -> Result<SearchSettings> {
        if self
            .store
            .get_settings_with_status(SettingsStatus::Future)
            .await?
            .is_some()
        {
            return Err(AppError::Validation(
                "A new index generation is already being built".to_string(),
            ));
        }

        // Generation ids are monotonic: the next id follows the current
        // PRESENT row
        let next_id = self
            .store
            .get_settings_with_status(SettingsStatus::Present)
            .await?
            .map(|p| p.id + 1)
            .unwrap_or(1);

        let mut settings = SearchSettings::new(
            next_id,
            &params.index_name,
            SettingsStatus::Future,
            &params.model_name,
            params.model_dimension,
        );
        settings.query_prefix = params.query_prefix.clone();
        settings.passage_prefix = params.passage_prefix.clone();

        self.store.insert_search_settings(&settings).await?;
        self.store.set_reindex_in_progress(true).await?;
        REINDEX_IN_PROGRESS.set(1.0);

        info!(
            settings_id = settings.id,
            model = %settings.model_name,
            dimension = settings.model_dimension,
            "New index generation requested"
        );
        Ok(settings)
    }

    /// Promote the FUTURE generation if its backfill is complete.
    ///
    /// Complete means every live pair (the push-based ingestion pair never
    /// counts) has a successful attempt against the FUTURE id; with no live
    /// pairs the swap happens immediately. Returns the promoted settings,
    /// or `None` when there is nothing to do yet.
    pub async fn check_and_promote(&self) -> Result<Option<SearchSettings>> {
        let Some(future) = self
            .store
            .get_settings_with_status(SettingsStatus::Future)
            .await?
        else {
            return Ok(None);
        };

        let live_pairs = self
            .store
            .list_cc_pairs()
            .await?
            .iter()
            .filter(|p| p.counts_for_backfill())
            .count();
        let successful = self
            .store
            .count_successful_pairs_for_settings(future.id)
            .await?;

        if live_pairs > 0 && successful < live_pairs {
            info!(
                settings_id = future.id,
                successful, live_pairs, "Backfill incomplete, not promoting"
            );
            return Ok(None);
        }

        let old_present = self
            .store
            .get_settings_with_status(SettingsStatus::Present)
            .await?;

        let promoted = match self.store.promote_future_settings().await {
            Ok(promoted) => promoted,
            // Another worker won the swap between our check and ours
            Err(AppError::NotFound(_)) => {
                info!("Promotion already performed elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // Attempts still pinned to the retired generation only waste cycles
        if let Some(past) = old_present {
            let cancelled = self
                .store
                .request_cancellation_for_settings(past.id)
                .await?;
            if cancelled > 0 {
                info!(
                    settings_id = past.id,
                    cancelled, "Cancelled attempts against retired generation"
                );
            }
        }

        self.store.set_reindex_in_progress(false).await?;
        REINDEX_IN_PROGRESS.set(0.0);
        self.recompute_document_counts().await?;

        info!(
            settings_id = promoted.id,
            index_name = %promoted.index_name,
            "Search settings promoted"
        );
        Ok(Some(promoted))
    }

    async fn recompute_document_counts(&self) -> Result<()> {
        for mut pair in self.store.list_cc_pairs().await? {
            match self.store.count_documents_for_cc_pair(pair.id).await {
                Ok(count) => {
                    pair.total_docs_indexed = count;
                    self.store.upsert_cc_pair(&pair).await?;
                }
                Err(e) => {
                    warn!(cc_pair_id = pair.id, error = %e, "Document count recompute failed");
                }
            }
        }
        Ok(())
    }
}
