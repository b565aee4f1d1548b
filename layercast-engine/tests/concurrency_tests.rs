//! Integration tests for concurrent access patterns
//!
//! At most one run per session, independent sessions in parallel,
//! configuration racing a start, and removal while a run is in flight.

mod helpers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use helpers::{
    collect_progress, request, settings, three_layer_store, three_layer_weights, SlowStorage,
};
use layercast_common::events::{EventBus, GenerationStatus};
use layercast_engine::persistence::SessionStore;
use layercast_engine::{EngineError, MemoryStorage, SessionManager};

const ORDER: &[&str] = &["Background", "Eyes", "Hat"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_start_rejected_while_running() {
    let storage = Arc::new(SlowStorage::new(Duration::from_millis(40)));
    let manager = SessionManager::new(storage.clone(), settings(2), EventBus::new(1024));

    let id = manager.create_session(three_layer_store()).await.unwrap();
    manager
        .configure(id, request(ORDER, three_layer_weights(), 4))
        .await
        .unwrap();

    let handle = manager.start_generation(id).await.unwrap();
    assert_eq!(handle.session_id(), id);

    // The check-and-set already happened; the session is owned by the run
    assert!(matches!(
        manager.start_generation(id).await,
        Err(EngineError::Conflict(_))
    ));
    assert!(matches!(
        manager.configure(id, request(ORDER, three_layer_weights(), 2)).await,
        Err(EngineError::Conflict(_))
    ));
    assert!(manager.get_session(id).await.unwrap().status.is_running());

    // Poll progress while the run proceeds
    let poller = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let snapshot = manager.get_progress(id).await.expect("progress present");
                let done = snapshot.status.is_terminal();
                seen.push(snapshot.percentage);
                if done {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let result = handle.join().await.unwrap();
    assert_eq!(result.total_supply, 4);
    assert_eq!(storage.uploads(), 4, "one upload per item, no second run");

    let seen = poller.await.unwrap();
    assert!(seen.windows(2).all(|w| w[1] >= w[0]), "polled {:?}", seen);
    assert_eq!(*seen.last().unwrap(), 100.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_exactly_one_wins() {
    let storage = Arc::new(SlowStorage::new(Duration::from_millis(10)));
    let manager = SessionManager::new(storage.clone(), settings(100), EventBus::new(1024));

    let id = manager.create_session(three_layer_store()).await.unwrap();
    manager
        .configure(id, request(ORDER, three_layer_weights(), 4))
        .await
        .unwrap();

    let mut join_set = JoinSet::new();
    for _ in 0..8 {
        let manager = manager.clone();
        join_set.spawn(async move { manager.start_generation(id).await });
    }

    let mut handles = Vec::new();
    let mut conflicts = 0;
    while let Some(joined) = join_set.join_next().await {
        match joined.expect("Task panicked") {
            Ok(handle) => handles.push(handle),
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(handles.len(), 1);
    assert_eq!(conflicts, 7);

    let result = handles.pop().unwrap().join().await.unwrap();
    assert_eq!(result.total_supply, 4);
    assert_eq!(storage.uploads(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_racing_configure_never_sees_pending_again() {
    for round in 0..20 {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new(4096);
        let manager = SessionManager::new(Arc::new(MemoryStorage::new()), settings(2), bus.clone())
            .with_store(SessionStore::new(temp.path()));
        let id = manager.create_session(three_layer_store()).await.unwrap();
        let mut rx = bus.subscribe();

        let configuring = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .configure(id, request(ORDER, three_layer_weights(), 4))
                    .await
            })
        };

        // Start as soon as the configuration lands
        let handle = loop {
            match manager.start_generation(id).await {
                Ok(handle) => break handle,
                Err(EngineError::Conflict(_)) => tokio::task::yield_now().await,
                Err(other) => panic!("round {}: unexpected error: {}", round, other),
            }
        };
        configuring.await.expect("Task panicked").unwrap();
        let result = handle.join().await.unwrap();
        assert_eq!(result.total_supply, 4);

        let snapshots = collect_progress(&mut rx, id).await;
        let started = snapshots
            .iter()
            .position(|s| s.status != GenerationStatus::Pending)
            .unwrap();
        assert!(
            snapshots[started..]
                .iter()
                .all(|s| s.status != GenerationStatus::Pending),
            "round {}: {:?}",
            round,
            snapshots.iter().map(|s| s.status).collect::<Vec<_>>()
        );
        assert!(snapshots[started..]
            .windows(2)
            .all(|w| w[1].percentage >= w[0].percentage));

        let last = manager.get_progress(id).await.unwrap();
        assert_eq!(last.status, GenerationStatus::Completed);
        assert_eq!(last.percentage, 100.0);

        let store = SessionStore::new(temp.path());
        assert!(store.session_dir(id).join("result.json").is_file());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_sessions_run_in_parallel() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = SessionManager::new(storage.clone(), settings(2), EventBus::new(4096));

    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = manager.create_session(three_layer_store()).await.unwrap();
        manager
            .configure(id, request(ORDER, three_layer_weights(), 4))
            .await
            .unwrap();
        ids.push(id);
    }

    let mut join_set = JoinSet::new();
    for id in ids.clone() {
        let manager = manager.clone();
        join_set.spawn(async move { manager.run_generation(id).await });
    }

    let mut finished = HashSet::new();
    while let Some(joined) = join_set.join_next().await {
        let result = joined.expect("Task panicked").unwrap();
        assert_eq!(result.total_supply, 4);
        for uri in &result.artifact_uris {
            assert!(uri.starts_with(&format!("mem://{}/", result.session_id)));
        }
        finished.insert(result.session_id);
    }
    assert_eq!(finished, ids.iter().copied().collect());

    // Four images plus one collection document per session
    assert_eq!(storage.len().await, 5 * 5);
    for id in ids {
        assert_eq!(
            manager.get_progress(id).await.unwrap().status,
            GenerationStatus::Completed
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_during_run_orphans_the_run() {
    let storage = Arc::new(SlowStorage::new(Duration::from_millis(30)));
    let manager = SessionManager::new(storage.clone(), settings(2), EventBus::new(1024));

    let id = manager.create_session(three_layer_store()).await.unwrap();
    manager
        .configure(id, request(ORDER, three_layer_weights(), 4))
        .await
        .unwrap();

    let handle = manager.start_generation(id).await.unwrap();
    manager.remove_session(id).await.unwrap();
    assert!(manager.get_progress(id).await.is_none());

    let outcome = handle.join().await;
    assert!(
        matches!(outcome, Err(EngineError::SessionNotFound(_))),
        "got {:?}",
        outcome.map(|r| r.total_supply)
    );

    // The orphaned run never brings the progress entry back
    assert!(manager.get_progress(id).await.is_none());
    assert_eq!(manager.session_count().await, 0);
    assert!(matches!(
        manager.get_result(id).await,
        Err(EngineError::SessionNotFound(_))
    ));
}
