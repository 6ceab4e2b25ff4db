use crate::error::Result;
use crate::models::access::{
    external_group_token, group_token, user_email_token, DocumentAccess, PUBLIC_TOKEN,
};
use crate::models::AccessType;
use crate::store::MetadataStore;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Computes flat ACL token sets from relational and externally-synced
/// permission data.
///
/// Resolution happens once at index time; the read side only performs a
/// set-intersection between a document's tokens and a user's tokens.
#[derive(Clone)]
pub struct AccessResolver {
    store: Arc<dyn MetadataStore>,
}

impl AccessResolver {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Resolve the access object for a document.
    ///
    /// A document that is not in the store yet (the race between discovery
    /// and embedding) resolves to null access: empty grants, not public.
    pub async fn for_document(&self, doc_id: &str) -> Result<DocumentAccess> {
        let Some(stored) = self.store.get_document(doc_id).await? else {
            tracing::debug!(document_id = %doc_id, "Document not yet stored, resolving null access");
            return Ok(DocumentAccess::null_access());
        };

        // Visibility policy comes from the owning pairs. SYNC pairs defer
        // entirely to externally-synced permissions; PUBLIC pairs make the
        // document public regardless of grants.
        let mut any_public_pair = false;
        let mut any_sync_pair = false;
        for pair_id in &stored.cc_pair_ids {
            if let Some(pair) = self.store.get_cc_pair(*pair_id).await? {
                match pair.access_type {
                    AccessType::Public => any_public_pair = true,
                    AccessType::Sync => any_sync_pair = true,
                    AccessType::Private => {}
                }
            }
        }

        let is_public = any_public_pair && !any_sync_pair;
        let groups = self.store.group_names_for_document(doc_id).await?;
        let internal = DocumentAccess::new(
            stored.document.owners.iter().map(|e| e.to_lowercase()),
            groups,
            is_public,
        );

        let Some(external) = self.store.get_external_access(doc_id).await? else {
            return Ok(internal);
        };

        Ok(internal.merged_with_external(
            external.external_user_emails.iter().cloned(),
            external.external_user_group_ids.iter().cloned(),
            external.is_public,
        ))
    }

    /// The requesting user's token set: their email, all their groups,
    /// their externally-synced groups, and the PUBLIC sentinel.
    pub async fn for_user(&self, email: &str) -> Result<BTreeSet<String>> {
        let mut tokens = BTreeSet::new();
        tokens.insert(user_email_token(email));
        tokens.insert(PUBLIC_TOKEN.to_string());

        for group in self.store.group_names_for_user(email).await? {
            tokens.insert(group_token(&group));
        }
        for (source, group_id) in self.store.external_groups_for_user(email).await? {
            tokens.insert(external_group_token(&source, &group_id));
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccessType, ConnectorCredentialPair, Document, DocumentSource, Section,
    };
    use crate::store::{InMemoryMetadataStore, StoredDocument, StoredExternalAccess, UserGroup};

    async fn setup() -> (Arc<InMemoryMetadataStore>, AccessResolver) {
        let store = Arc::new(InMemoryMetadataStore::new());
        let resolver = AccessResolver::new(store.clone());
        (store, resolver)
    }

    fn stored_doc(id: &str, cc_pair_id: i64, owners: Vec<String>) -> StoredDocument {
        StoredDocument::new(
            Document::new(
                id,
                DocumentSource::GoogleDrive,
                "doc",
                vec![Section::new("text", None)],
            )
            .with_owners(owners),
            cc_pair_id,
        )
    }

    #[tokio::test]
    async fn test_missing_document_fails_closed() {
        let (_store, resolver) = setup().await;
        let access = resolver.for_document("ghost").await.unwrap();
        assert_eq!(access, DocumentAccess::null_access());
        assert!(access.to_acl_tokens().is_empty());
    }

    #[tokio::test]
    async fn test_public_pair_grants_public() {
        let (store, resolver) = setup().await;
        store
            .upsert_cc_pair(&ConnectorCredentialPair::new(
                1,
                1,
                1,
                "wiki",
                AccessType::Public,
            ))
            .await
            .unwrap();
        store
            .upsert_document(&stored_doc("d1", 1, vec!["Owner@X.com".to_string()]))
            .await
            .unwrap();

        let tokens = resolver.for_document("d1").await.unwrap().to_acl_tokens();
        assert!(tokens.contains(PUBLIC_TOKEN));
        assert!(tokens.contains("user_email:owner@x.com"));
    }

    #[tokio::test]
    async fn test_sync_pair_ignores_relational_public() {
        let (store, resolver) = setup().await;
        store
            .upsert_cc_pair(&ConnectorCredentialPair::new(
                1,
                1,
                1,
                "drive",
                AccessType::Sync,
            ))
            .await
            .unwrap();
        store
            .upsert_document(&stored_doc("d1", 1, vec![]))
            .await
            .unwrap();
        store
            .upsert_external_access(
                "d1",
                &StoredExternalAccess {
                    external_user_emails: ["ext@y.com".to_string()].into(),
                    external_user_group_ids: [("gdrive".to_string(), "team".to_string())].into(),
                    is_public: false,
                },
            )
            .await
            .unwrap();

        let access = resolver.for_document("d1").await.unwrap();
        assert!(!access.is_public);
        let tokens = access.to_acl_tokens();
        assert!(tokens.contains("user_email:ext@y.com"));
        assert!(tokens.contains("external_group:gdrive:team"));
    }

    #[tokio::test]
    async fn test_resolved_acl_superset_of_external_groups() {
        let (store, resolver) = setup().await;
        store
            .upsert_cc_pair(&ConnectorCredentialPair::new(
                1,
                1,
                1,
                "drive",
                AccessType::Private,
            ))
            .await
            .unwrap();
        store
            .upsert_document(&stored_doc("d1", 1, vec!["a@x.com".to_string()]))
            .await
            .unwrap();
        let external = StoredExternalAccess {
            external_user_emails: Default::default(),
            external_user_group_ids: [
                ("slack".to_string(), "eng".to_string()),
                ("slack".to_string(), "ops".to_string()),
            ]
            .into(),
            is_public: false,
        };
        store.upsert_external_access("d1", &external).await.unwrap();

        let tokens = resolver.for_document("d1").await.unwrap().to_acl_tokens();
        for (source, group_id) in &external.external_user_group_ids {
            assert!(tokens.contains(&external_group_token(source, group_id)));
        }
        // Internal grants survive the merge.
        assert!(tokens.contains("user_email:a@x.com"));
    }

    #[tokio::test]
    async fn test_user_tokens_include_groups_and_public() {
        let (store, resolver) = setup().await;
        store
            .upsert_user_group(&UserGroup::new(1, "eng", vec!["a@x.com".to_string()]))
            .await
            .unwrap();
        store
            .upsert_external_group("slack", "oncall", &["a@x.com".to_string()])
            .await
            .unwrap();

        let tokens = resolver.for_user("a@x.com").await.unwrap();
        assert!(tokens.contains("user_email:a@x.com"));
        assert!(tokens.contains("group:eng"));
        assert!(tokens.contains("external_group:slack:oncall"));
        assert!(tokens.contains(PUBLIC_TOKEN));
    }

    #[tokio::test]
    async fn test_authorization_is_intersection() {
        let (store, resolver) = setup().await;
        store
            .upsert_cc_pair(&ConnectorCredentialPair::new(
                1,
                1,
                1,
                "wiki",
                AccessType::Private,
            ))
            .await
            .unwrap();
        store
            .upsert_document(&stored_doc("d1", 1, vec!["a@x.com".to_string()]))
            .await
            .unwrap();

        let doc_tokens = resolver.for_document("d1").await.unwrap().to_acl_tokens();
        let allowed = resolver.for_user("a@x.com").await.unwrap();
        let denied = resolver.for_user("b@y.com").await.unwrap();

        assert!(doc_tokens.intersection(&allowed).next().is_some());
        assert!(doc_tokens.intersection(&denied).next().is_none());
    }
}
