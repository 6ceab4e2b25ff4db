use crate::models::DocumentSource;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Documents without an update timestamp stay visible under cutoff queries
/// narrower than this many days. A default "recent documents" query must not
/// silently exclude sources that never report timestamps.
pub const UNDATED_GRACE_DAYS: i64 = 92;

/// Read-side filter set, compiled into a boolean predicate by each store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFilters {
    /// Requesting user's ACL tokens; `None` bypasses ACL enforcement
    /// (system-internal reads only)
    pub access_tokens: Option<BTreeSet<String>>,

    /// Restrict to these source types (OR)
    pub sources: Vec<DocumentSource>,

    /// Restrict to chunks carrying at least one of these tags
    pub tags: Vec<String>,

    /// Restrict to members of at least one of these document sets
    pub document_sets: Vec<String>,

    pub tenant_id: Option<String>,

    /// Only documents updated within this many days
    pub max_age_days: Option<i64>,
}

impl IndexFilters {
    pub fn for_user_tokens(tokens: BTreeSet<String>) -> Self {
        Self {
            access_tokens: Some(tokens),
            ..Default::default()
        }
    }

    /// Cutoff instant for the configured window, if any
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age_days.map(|days| now - Duration::days(days))
    }

    /// Whether undated documents pass the cutoff clause.
    ///
    /// A window wider than the grace period is an explicit request for old
    /// documents only, so undated ones drop out; anything narrower keeps
    /// them visible.
    pub fn includes_undated(&self) -> bool {
        match self.max_age_days {
            Some(days) => days <= UNDATED_GRACE_DAYS,
            None => true,
        }
    }

    /// Evaluate the full predicate against one chunk's filterable fields
    pub fn matches(&self, view: &ChunkFilterView<'_>) -> bool {
        if view.hidden {
            return false;
        }

        if let Some(ref tokens) = self.access_tokens {
            if view.acl_tokens.intersection(tokens).next().is_none() {
                return false;
            }
        }

        if !self.sources.is_empty() && !self.sources.contains(&view.source) {
            return false;
        }

        if !self.tags.is_empty() && !self.tags.iter().any(|t| view.tags.contains(t)) {
            return false;
        }

        if !self.document_sets.is_empty()
            && !self
                .document_sets
                .iter()
                .any(|s| view.document_sets.contains(s))
        {
            return false;
        }

        if let Some(ref tenant) = self.tenant_id {
            if view.tenant_id != Some(tenant.as_str()) {
                return false;
            }
        }

        if let Some(cutoff) = self.cutoff(Utc::now()) {
            match view.updated_at {
                Some(updated_at) => {
                    if updated_at < cutoff {
                        return false;
                    }
                }
                None => {
                    if !self.includes_undated() {
                        return false;
                    }
                }
            }
        }

        true
    }
}

/// Borrowed view of the fields a store keeps per chunk for filtering
#[derive(Debug)]
pub struct ChunkFilterView<'a> {
    pub acl_tokens: &'a BTreeSet<String>,
    pub source: DocumentSource,
    pub tags: &'a [String],
    pub document_sets: &'a [String],
    pub tenant_id: Option<&'a str>,
    pub updated_at: Option<DateTime<Utc>>,
    pub hidden: bool,
}
