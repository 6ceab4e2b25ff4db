//! External permission sync: source state flows into the store and gates
//! retrieval.

mod common;

use common::{doc, engine};
use docsync::access::AccessResolver;
use docsync::connectors::StaticPermissionSource;
use docsync::coordination::{CoordinationBackend, SyncKey, SyncScope};
use docsync::index::{DocumentIndex, IndexFilters};
use docsync::models::AccessType;
use docsync::store::StoredExternalAccess;
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn test_permission_sync_gates_retrieval() {
    let mut engine = engine().await;
    engine.seed_pair(1, AccessType::Sync).await;

    // Indexed before any external permissions arrive: a SYNC pair's
    // document fails closed
    engine
        .pipeline
        .index_documents(&[doc("spec", "Spec", "internal architecture notes")], 1, None, None)
        .await
        .unwrap();

    let resolver = AccessResolver::new(engine.store.clone());
    let reader = IndexFilters::for_user_tokens(resolver.for_user("lee@corp.com").await.unwrap());
    assert!(engine
        .index
        .keyword_retrieval("architecture", &reader, 10)
        .await
        .unwrap()
        .is_empty());

    let source = StaticPermissionSource::new("confluence");
    source.set_document_permissions(vec![(
        "spec".to_string(),
        StoredExternalAccess {
            external_user_emails: BTreeSet::new(),
            external_user_group_ids: BTreeSet::from([(
                "confluence".to_string(),
                "eng".to_string(),
            )]),
            is_public: false,
        },
    )]);
    source.set_group_memberships(vec![("eng".to_string(), vec!["lee@corp.com".to_string()])]);
    engine.registry.register_permission_source(1, Arc::new(source));

    engine
        .orchestrator
        .orchestrate_permission_sync()
        .await
        .unwrap();
    assert_eq!(engine.run_dispatched().await, 1);
    assert_eq!(engine.monitor.tick().await.unwrap(), 1);

    let key = SyncKey::new(SyncScope::PermissionSync, "1").unwrap();
    assert!(!engine.backend.fence_exists(&key).await.unwrap());

    // Membership now resolves through the synced group
    let reader = IndexFilters::for_user_tokens(resolver.for_user("lee@corp.com").await.unwrap());
    let hits = engine
        .index
        .keyword_retrieval("architecture", &reader, 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "spec");

    // Everyone else still sees nothing
    let outsider = IndexFilters::for_user_tokens(resolver.for_user("sam@corp.com").await.unwrap());
    assert!(engine
        .index
        .keyword_retrieval("architecture", &outsider, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_non_sync_pairs_are_never_orchestrated() {
    let mut engine = engine().await;
    engine.seed_pair(2, AccessType::Public).await;
    engine
        .registry
        .register_permission_source(2, Arc::new(StaticPermissionSource::new("jira")));

    engine
        .orchestrator
        .orchestrate_permission_sync()
        .await
        .unwrap();

    assert_eq!(engine.run_dispatched().await, 0);
    let key = SyncKey::new(SyncScope::PermissionSync, "2").unwrap();
    assert!(!engine.backend.fence_exists(&key).await.unwrap());
}
