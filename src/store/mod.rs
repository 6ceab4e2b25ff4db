pub mod factory;
pub mod locks;
pub mod memory;
pub mod metadata;
pub mod sled_store;

pub use factory::create_metadata_store;
pub use locks::DocumentLockRegistry;
pub use memory::InMemoryMetadataStore;
pub use metadata::{DocumentSet, MetadataStore, StoredDocument, StoredExternalAccess, UserGroup};
pub use sled_store::SledMetadataStore;
