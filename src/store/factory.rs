use crate::config::{MetadataBackend, MetadataConfig};
use crate::error::{AppError, Result};
use crate::store::memory::InMemoryMetadataStore;
use crate::store::metadata::MetadataStore;
use crate::store::sled_store::SledMetadataStore;
use std::sync::Arc;

/// Build the metadata store selected by configuration
pub fn create_metadata_store(config: &MetadataConfig) -> Result<Arc<dyn MetadataStore>> {
    match config.backend {
        MetadataBackend::InMemory => {
            tracing::info!("Using in-memory metadata store");
            Ok(Arc::new(InMemoryMetadataStore::new()))
        }
        MetadataBackend::Sled => {
            let path = config.path.as_ref().ok_or_else(|| {
                AppError::Configuration(
                    "metadata.path is required for the sled backend".to_string(),
                )
            })?;
            Ok(Arc::new(SledMetadataStore::new(path)?))
        }
    }
}
