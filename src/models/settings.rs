use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle tag of an embedding-model generation.
///
/// Exactly one row is `Present` at all times and at most one is `Future`;
/// the store enforces this the way a partial unique index would.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SettingsStatus {
    Past,
    Present,
    Future,
}

/// A named embedding-model/index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    pub id: i64,
    /// Name of the physical index this generation writes to
    pub index_name: String,
    pub status: SettingsStatus,
    pub model_name: String,
    pub model_dimension: usize,
    /// Prefix prepended to query-side text before embedding
    pub query_prefix: String,
    /// Prefix prepended to passage-side text before embedding
    pub passage_prefix: String,
    pub created_at: DateTime<Utc>,
}

impl SearchSettings {
    pub fn new(
        id: i64,
        index_name: impl Into<String>,
        status: SettingsStatus,
        model_name: impl Into<String>,
        model_dimension: usize,
    ) -> Self {
        Self {
            id,
            index_name: index_name.into(),
            status,
            model_name: model_name.into(),
            model_dimension,
            query_prefix: String::new(),
            passage_prefix: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// Parameters for requesting a new embedding generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGenerationParams {
    pub index_name: String,
    pub model_name: String,
    pub model_dimension: usize,
    #[serde(default)]
    pub query_prefix: String,
    #[serde(default)]
    pub passage_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        use std::str::FromStr;
        assert_eq!(SettingsStatus::Present.to_string(), "present");
        assert_eq!(
            SettingsStatus::from_str("future").unwrap(),
            SettingsStatus::Future
        );
    }

    #[test]
    fn test_new_settings_defaults() {
        let settings = SearchSettings::new(7, "chunks_v2", SettingsStatus::Future, "e5-base", 768);
        assert_eq!(settings.id, 7);
        assert_eq!(settings.status, SettingsStatus::Future);
        assert!(settings.query_prefix.is_empty());
    }
}
