use futures::TryStreamExt;

use chorus::message::Event;
use chorus::store::memory::InMemoryStore;
use chorus::store::{EventStore, Snapshot, StoreError, StoreEvent};

use crate::common::{order_paid, order_placed};

#[tokio::test]
async fn load_returns_events_in_append_order_across_appends() {
    let store = InMemoryStore::new();

    let version = store
        .append("order-7", 0, vec![order_placed(10), order_paid(3)])
        .await
        .unwrap();
    assert_eq!(version, 2);

    let version = store
        .append("order-7", 2, vec![order_paid(4)])
        .await
        .unwrap();
    assert_eq!(version, 3);

    let events: Vec<StoreEvent> = store.stream("order-7", 0).try_collect().await.unwrap();

    let kinds: Vec<&str> = events.iter().map(|e| e.event().kind()).collect();
    assert_eq!(kinds, vec!["OrderPlaced", "OrderPaid", "OrderPaid"]);

    let sequence_numbers: Vec<u64> = events.iter().map(StoreEvent::sequence_number).collect();
    assert_eq!(sequence_numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn stale_expected_version_conflicts_and_appends_nothing() {
    let store = InMemoryStore::new();

    let version = store
        .append("order-1", 0, vec![order_placed(10)])
        .await
        .unwrap();
    assert_eq!(version, 1);

    // Losing writer: same expected version, multiple events. All-or-nothing.
    let error = store
        .append("order-1", 0, vec![order_placed(20), order_paid(20)])
        .await
        .unwrap_err();

    assert!(error.is_conflict());
    match error {
        StoreError::Conflict {
            stream_key,
            expected,
            actual,
        } => {
            assert_eq!(stream_key, "order-1");
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }

    let events: Vec<StoreEvent> = store.stream("order-1", 0).try_collect().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event().payload()["amount"], 10);
}

#[tokio::test]
async fn unknown_stream_yields_an_empty_stream() {
    let store = InMemoryStore::new();

    let events: Vec<StoreEvent> = store.stream("order-404", 0).try_collect().await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn load_from_version_skips_the_prefix() {
    let store = InMemoryStore::new();
    store
        .append(
            "order-9",
            0,
            vec![order_placed(1), order_paid(1), order_paid(2), order_paid(3)],
        )
        .await
        .unwrap();

    let events: Vec<StoreEvent> = store.stream("order-9", 2).try_collect().await.unwrap();

    let sequence_numbers: Vec<u64> = events.iter().map(StoreEvent::sequence_number).collect();
    assert_eq!(sequence_numbers, vec![3, 4]);
}

#[tokio::test]
async fn streams_are_restartable() {
    let store = InMemoryStore::new();
    store
        .append("order-2", 0, vec![order_placed(5), order_paid(5)])
        .await
        .unwrap();

    let first: Vec<StoreEvent> = store.stream("order-2", 0).try_collect().await.unwrap();
    let second: Vec<StoreEvent> = store.stream("order-2", 0).try_collect().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn concurrent_saves_against_one_stream_serialize() {
    let store = InMemoryStore::new();

    let winner = {
        let store = store.clone();
        tokio::spawn(async move { store.append("order-3", 0, vec![order_placed(10)]).await })
    };
    let loser = {
        let store = store.clone();
        tokio::spawn(async move { store.append("order-3", 0, vec![order_placed(20)]).await })
    };

    let outcomes = [winner.await.unwrap(), loser.await.unwrap()];
    let succeeded = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let conflicted = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(error) if error.is_conflict()))
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(conflicted, 1);

    let events: Vec<StoreEvent> = store.stream("order-3", 0).try_collect().await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn latest_snapshot_wins_and_is_independent_of_appends() {
    let store = InMemoryStore::new();

    assert!(store.load_snapshot("order-5").await.unwrap().is_none());

    let early = Snapshot {
        stream_key: "order-5".to_owned(),
        version: 1,
        state: serde_json::json!({ "placed": true, "amount": 10, "paid_total": 0 }),
        captured_on: chrono::Utc::now(),
    };
    let late = Snapshot {
        version: 3,
        state: serde_json::json!({ "placed": true, "amount": 10, "paid_total": 7 }),
        ..early.clone()
    };

    store.save_snapshot(early).await.unwrap();
    store.save_snapshot(late.clone()).await.unwrap();

    let loaded = store.load_snapshot("order-5").await.unwrap().unwrap();
    assert_eq!(loaded, late);

    // No events were ever appended; snapshots live on their own.
    let events: Vec<StoreEvent> = store.stream("order-5", 0).try_collect().await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn store_is_usable_through_shared_pointers() {
    let store = std::sync::Arc::new(InMemoryStore::new());

    let events: Vec<Event> = vec![order_placed(10)];
    let version = store.append("order-8", 0, events).await.unwrap();
    assert_eq!(version, 1);

    let boxed: Box<dyn EventStore> = Box::new(InMemoryStore::new());
    let version = boxed.append("order-8", 0, vec![order_placed(1)]).await.unwrap();
    assert_eq!(version, 1);
}
