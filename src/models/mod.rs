pub mod access;
pub mod cc_pair;
pub mod document;
pub mod settings;

pub use access::{DocumentAccess, PUBLIC_TOKEN};
pub use cc_pair::{
    AccessType, CcPairStatus, ConnectorCredentialPair, IndexAttempt, IndexAttemptStatus,
    INGESTION_CC_PAIR_ID,
};
pub use document::{Document, DocumentSource, IndexChunk, Section};
pub use settings::{NewGenerationParams, SearchSettings, SettingsStatus};
