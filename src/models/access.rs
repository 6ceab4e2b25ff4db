use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sentinel token granting visibility to every user
pub const PUBLIC_TOKEN: &str = "PUBLIC";

const USER_EMAIL_PREFIX: &str = "user_email:";
const GROUP_PREFIX: &str = "group:";
const EXTERNAL_GROUP_PREFIX: &str = "external_group:";

/// Immutable per-document access value object.
///
/// Built by unioning internal relational grants with externally-synced
/// permissions. Authorization on the read side is a set-intersection test
/// between a document's token set and a requesting user's token set, so no
/// per-query joins are needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentAccess {
    pub user_emails: BTreeSet<String>,
    pub user_groups: BTreeSet<String>,
    pub external_user_emails: BTreeSet<String>,
    /// `(source, group_id)` pairs discovered by permission-sync jobs
    pub external_user_group_ids: BTreeSet<(String, String)>,
    pub is_public: bool,
}

impl DocumentAccess {
    pub fn new(
        user_emails: impl IntoIterator<Item = String>,
        user_groups: impl IntoIterator<Item = String>,
        is_public: bool,
    ) -> Self {
        Self {
            user_emails: user_emails.into_iter().collect(),
            user_groups: user_groups.into_iter().collect(),
            external_user_emails: BTreeSet::new(),
            external_user_group_ids: BTreeSet::new(),
            is_public,
        }
    }

    /// Fail-closed access for documents caught in the race between discovery
    /// and embedding: empty grants, not public.
    pub fn null_access() -> Self {
        Self::default()
    }

    /// Return a copy widened by externally-synced grants. External additions
    /// only ever widen visibility, never narrow it.
    pub fn merged_with_external(
        &self,
        external_user_emails: impl IntoIterator<Item = String>,
        external_user_group_ids: impl IntoIterator<Item = (String, String)>,
        external_is_public: bool,
    ) -> Self {
        let mut merged = self.clone();
        merged.external_user_emails.extend(external_user_emails);
        merged
            .external_user_group_ids
            .extend(external_user_group_ids);
        merged.is_public = merged.is_public || external_is_public;
        merged
    }

    /// Flatten into the ACL token set stored on every chunk of the document.
    ///
    /// Prefixes are disjoint, so tokens from different grant kinds can never
    /// collide. `is_public` always materializes as the PUBLIC sentinel.
    pub fn to_acl_tokens(&self) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();

        for email in self.user_emails.iter().chain(&self.external_user_emails) {
            tokens.insert(format!("{}{}", USER_EMAIL_PREFIX, email.to_lowercase()));
        }
        for group in &self.user_groups {
            tokens.insert(format!("{}{}", GROUP_PREFIX, group));
        }
        for (source, group_id) in &self.external_user_group_ids {
            tokens.insert(format!("{}{}:{}", EXTERNAL_GROUP_PREFIX, source, group_id));
        }
        if self.is_public {
            tokens.insert(PUBLIC_TOKEN.to_string());
        }

        tokens
    }
}

/// Build the token for a user email
pub fn user_email_token(email: &str) -> String {
    format!("{}{}", USER_EMAIL_PREFIX, email.to_lowercase())
}

/// Build the token for an internal group/teamspace
pub fn group_token(group: &str) -> String {
    format!("{}{}", GROUP_PREFIX, group)
}

/// Build the token for an externally-synced group
pub fn external_group_token(source: &str, group_id: &str) -> String {
    format!("{}{}:{}", EXTERNAL_GROUP_PREFIX, source, group_id)
}
