//! End-to-end runs of the fence/taskset protocol: orchestrate, execute,
//! finalize.

mod common;

use common::{doc, engine};
use docsync::coordination::{CoordinationBackend, FencePayload, SyncKey, SyncScope};
use docsync::models::{AccessType, CcPairStatus};
use docsync::store::{DocumentSet, MetadataStore, StoredDocument, UserGroup};
use docsync::connectors::StaticConnector;
use std::sync::Arc;

#[tokio::test]
async fn test_document_set_sync_full_cycle() {
    let mut engine = engine().await;
    engine.seed_pair(1, AccessType::Public).await;
    for id in ["a", "b", "c"] {
        engine
            .store
            .upsert_document(&StoredDocument::new(doc(id, id, "body"), 1))
            .await
            .unwrap();
    }
    engine
        .store
        .upsert_document_set(&DocumentSet::new(42, "eng-docs", vec![1]))
        .await
        .unwrap();

    engine.orchestrator.orchestrate_document_sets().await.unwrap();

    let key = SyncKey::new(SyncScope::DocumentSet, "42").unwrap();
    assert!(engine.backend.fence_exists(&key).await.unwrap());
    assert_eq!(engine.backend.taskset_len(&key).await.unwrap(), 3);

    // Taskset not drained yet: the monitor must leave the fence alone
    assert_eq!(engine.monitor.tick().await.unwrap(), 0);
    assert!(engine.backend.fence_exists(&key).await.unwrap());

    assert_eq!(engine.run_dispatched().await, 3);
    assert_eq!(engine.backend.taskset_len(&key).await.unwrap(), 0);

    assert_eq!(engine.monitor.tick().await.unwrap(), 1);
    assert!(!engine.backend.fence_exists(&key).await.unwrap());
    assert!(engine
        .store
        .get_document_set(42)
        .await
        .unwrap()
        .unwrap()
        .is_up_to_date);

    // Nothing left to finalize; a second tick is a no-op
    assert_eq!(engine.monitor.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_task_object_resyncs_after_fence_goes_stale() {
    let mut engine = engine().await;
    engine.seed_pair(1, AccessType::Public).await;
    for id in ["a", "b"] {
        engine
            .store
            .upsert_document(&StoredDocument::new(doc(id, id, "body"), 1))
            .await
            .unwrap();
    }
    engine
        .store
        .upsert_document_set(&DocumentSet::new(42, "eng-docs", vec![1]))
        .await
        .unwrap();

    engine.orchestrator.orchestrate_document_sets().await.unwrap();
    let key = SyncKey::new(SyncScope::DocumentSet, "42").unwrap();

    // Complete one task and fail the other: its id stays in the taskset
    let completed = engine.task_rx.try_recv().unwrap();
    engine.executor.execute(&completed).await.unwrap();
    engine
        .backend
        .taskset_remove(completed.id.key(), &completed.id)
        .await
        .unwrap();
    let _failed = engine.task_rx.try_recv().unwrap();

    // Wedged: the monitor cannot finalize and the orchestrator skips the
    // fenced object
    assert_eq!(engine.monitor.tick().await.unwrap(), 0);
    assert!(engine.backend.fence_exists(&key).await.unwrap());
    engine.orchestrator.orchestrate_document_sets().await.unwrap();
    assert!(engine.task_rx.try_recv().is_err());

    // Age the fence past the stale timeout, as time passing would
    let fence = engine.backend.get_fence(&key).await.unwrap().unwrap();
    engine
        .backend
        .set_fence(
            &key,
            &FencePayload {
                task_count: fence.task_count,
                set_at: fence.set_at - chrono::Duration::hours(2),
            },
        )
        .await
        .unwrap();

    // The monitor clears the stalled sync and the next orchestration pass
    // regenerates the whole batch
    assert_eq!(engine.monitor.tick().await.unwrap(), 0);
    assert!(!engine.backend.fence_exists(&key).await.unwrap());

    engine.orchestrator.orchestrate_document_sets().await.unwrap();
    assert_eq!(engine.run_dispatched().await, 2);
    assert_eq!(engine.monitor.tick().await.unwrap(), 1);
    assert!(engine
        .store
        .get_document_set(42)
        .await
        .unwrap()
        .unwrap()
        .is_up_to_date);
}

#[tokio::test]
async fn test_pending_deletion_set_is_removed_at_finalize() {
    let mut engine = engine().await;
    engine.seed_pair(1, AccessType::Public).await;
    engine
        .store
        .upsert_document(&StoredDocument::new(doc("d", "d", "body"), 1))
        .await
        .unwrap();

    let mut set = DocumentSet::new(7, "doomed", vec![1]);
    set.pending_deletion = true;
    engine.store.upsert_document_set(&set).await.unwrap();

    engine.orchestrator.orchestrate_document_sets().await.unwrap();
    engine.run_dispatched().await;
    assert_eq!(engine.monitor.tick().await.unwrap(), 1);

    assert!(engine.store.get_document_set(7).await.unwrap().is_none());
}

#[tokio::test]
async fn test_user_group_sync_marks_group_up_to_date() {
    let mut engine = engine().await;
    engine.seed_pair(1, AccessType::Private).await;
    engine
        .store
        .upsert_document(&StoredDocument::new(doc("g1", "g1", "body"), 1))
        .await
        .unwrap();

    let mut group = UserGroup::new(5, "platform", vec!["ana@corp.com".to_string()]);
    group.cc_pair_ids = vec![1];
    engine.store.upsert_user_group(&group).await.unwrap();

    engine.orchestrator.orchestrate_user_groups().await.unwrap();
    engine.run_dispatched().await;
    engine.monitor.tick().await.unwrap();

    assert!(engine
        .store
        .get_user_group(5)
        .await
        .unwrap()
        .unwrap()
        .is_up_to_date);
}

#[tokio::test]
async fn test_connector_deletion_removes_pair_after_drain() {
    let mut engine = engine().await;
    engine.seed_present_settings().await;

    let mut pair = engine.seed_pair(9, AccessType::Public).await;
    engine
        .registry
        .register_connector(9, Arc::new(StaticConnector::new(Vec::new())));
    for id in ["del-1", "del-2"] {
        engine
            .store
            .upsert_document(&StoredDocument::new(doc(id, id, "body"), 9))
            .await
            .unwrap();
    }

    pair.status = CcPairStatus::Deleting;
    engine.store.upsert_cc_pair(&pair).await.unwrap();

    engine
        .orchestrator
        .orchestrate_connector_deletions()
        .await
        .unwrap();
    assert_eq!(engine.run_dispatched().await, 2);
    assert_eq!(engine.monitor.tick().await.unwrap(), 1);

    assert!(engine.store.get_cc_pair(9).await.unwrap().is_none());
    assert!(engine.registry.connector(9).is_none());
    assert!(engine.store.get_document("del-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_pruning_deletes_only_stale_documents() {
    let mut engine = engine().await;
    engine.seed_present_settings().await;
    engine.seed_pair(3, AccessType::Public).await;

    let connector = Arc::new(StaticConnector::new(vec![doc("kept", "kept", "body")]));
    engine.registry.register_connector(3, connector);

    for id in ["kept", "stale"] {
        engine
            .store
            .upsert_document(&StoredDocument::new(doc(id, id, "body"), 3))
            .await
            .unwrap();
    }

    engine.orchestrator.orchestrate_pruning().await.unwrap();
    assert_eq!(engine.run_dispatched().await, 1);
    engine.monitor.tick().await.unwrap();

    assert!(engine.store.get_document("kept").await.unwrap().is_some());
    assert!(engine.store.get_document("stale").await.unwrap().is_none());

    // With the source clean, another pass raises no fence at all
    engine.orchestrator.orchestrate_pruning().await.unwrap();
    let key = SyncKey::new(SyncScope::ConnectorPruning, "3").unwrap();
    assert!(!engine.backend.fence_exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_full_connector_indexing_cycle_through_fence() {
    let mut engine = engine().await;
    engine.seed_present_settings().await;
    engine.seed_pair(2, AccessType::Public).await;
    engine.registry.register_connector(
        2,
        Arc::new(StaticConnector::new(vec![
            doc("w1", "Welcome", "getting started guide"),
            doc("w2", "Deploys", "how we ship to production"),
        ])),
    );

    engine
        .orchestrator
        .orchestrate_connector_indexing()
        .await
        .unwrap();
    assert_eq!(engine.run_dispatched().await, 1);
    assert_eq!(engine.monitor.tick().await.unwrap(), 1);

    let pair = engine.store.get_cc_pair(2).await.unwrap().unwrap();
    assert_eq!(pair.total_docs_indexed, 2);
    assert!(engine.store.get_document("w1").await.unwrap().is_some());
}
