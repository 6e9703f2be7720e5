use chrono::Utc;
use futures::TryStreamExt;

use chorus::repository::{Repository, RepositoryError};
use chorus::store::memory::InMemoryStore;
use chorus::store::{EventStore, Snapshot};
use chorus::{Aggregate, AggregateState};

use crate::common::{order_paid, Order, OrderCommand, OrderState};

fn repository(store: &InMemoryStore) -> Repository<Order, InMemoryStore> {
    Repository::new(store.clone())
}

#[tokio::test]
async fn handle_command_persists_events_and_updates_state() {
    let store = InMemoryStore::new();
    let repository = repository(&store);

    let mut state = repository.load("42").await.unwrap();
    assert_eq!(state.version(), 0);
    assert_eq!(state.inner(), &OrderState::default());

    let persisted = repository
        .handle_command(&mut state, OrderCommand::Place { amount: 100 })
        .await
        .unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].sequence_number(), 1);
    assert_eq!(persisted[0].stream_key, "order-42");

    repository
        .handle_command(&mut state, OrderCommand::Pay { amount: 60 })
        .await
        .unwrap();

    assert_eq!(state.version(), 2);
    assert!(state.uncommitted().is_empty());

    let loaded = repository.load("42").await.unwrap();
    assert_eq!(loaded.version(), 2);
    assert_eq!(
        loaded.inner(),
        &OrderState {
            placed: true,
            amount: 100,
            paid_total: 60,
        }
    );
}

#[tokio::test]
async fn rejected_command_changes_nothing() {
    let store = InMemoryStore::new();
    let repository = repository(&store);

    let mut state = repository.load("43").await.unwrap();
    let error = repository
        .handle_command(&mut state, OrderCommand::Pay { amount: 10 })
        .await
        .unwrap_err();

    assert!(matches!(error, RepositoryError::Domain(_)));
    assert_eq!(state.version(), 0);
    assert!(state.uncommitted().is_empty());
}

#[tokio::test]
async fn conflicting_save_is_surfaced_and_retried_with_a_fresh_load() {
    let store = InMemoryStore::new();
    let repository = repository(&store);

    let mut state = repository.load("44").await.unwrap();
    repository
        .handle_command(&mut state, OrderCommand::Place { amount: 10 })
        .await
        .unwrap();

    // Two control flows loaded the same version.
    let mut first = repository.load("44").await.unwrap();
    let mut second = repository.load("44").await.unwrap();

    repository
        .handle_command(&mut first, OrderCommand::Pay { amount: 5 })
        .await
        .unwrap();

    let error = repository
        .handle_command(&mut second, OrderCommand::Pay { amount: 7 })
        .await
        .unwrap_err();
    assert!(error.is_conflict());

    // The retry protocol: re-load, re-apply.
    let mut fresh = repository.load("44").await.unwrap();
    repository
        .handle_command(&mut fresh, OrderCommand::Pay { amount: 7 })
        .await
        .unwrap();

    let loaded = repository.load("44").await.unwrap();
    assert_eq!(loaded.inner().paid_total, 12);
    assert_eq!(loaded.version(), 3);
}

#[tokio::test]
async fn snapshot_and_tail_replay_match_full_replay_for_every_cut_point() {
    let store = InMemoryStore::new();
    let repository = repository(&store);

    let mut state = repository.load("45").await.unwrap();
    repository
        .handle_command(&mut state, OrderCommand::Place { amount: 50 })
        .await
        .unwrap();
    for amount in 1..=5 {
        repository
            .handle_command(&mut state, OrderCommand::Pay { amount })
            .await
            .unwrap();
    }

    let expected = repository.load("45").await.unwrap();
    assert_eq!(expected.version(), 6);

    // Fold the stream by hand, snapshotting at every cut point; the load
    // must come out identical every time.
    let mut folded = OrderState::default();
    for cut in 1..=expected.version() {
        let events: Vec<_> = store.stream("order-45", cut - 1).try_collect().await.unwrap();
        folded = Order::apply_event(folded, events[0].event()).unwrap();

        store
            .save_snapshot(Snapshot {
                stream_key: "order-45".to_owned(),
                version: cut,
                state: serde_json::to_value(&folded).unwrap(),
                captured_on: Utc::now(),
            })
            .await
            .unwrap();

        let loaded = repository.load("45").await.unwrap();
        assert_eq!(loaded.version(), expected.version(), "cut point {cut}");
        assert_eq!(loaded.inner(), expected.inner(), "cut point {cut}");
    }
}

#[tokio::test]
async fn undecodable_snapshot_falls_back_to_full_replay() {
    let store = InMemoryStore::new();
    let repository = repository(&store);

    let mut state = repository.load("46").await.unwrap();
    repository
        .handle_command(&mut state, OrderCommand::Place { amount: 9 })
        .await
        .unwrap();

    store
        .save_snapshot(Snapshot {
            stream_key: "order-46".to_owned(),
            version: 1,
            state: serde_json::json!("not an order state"),
            captured_on: Utc::now(),
        })
        .await
        .unwrap();

    let loaded = repository.load("46").await.unwrap();
    assert_eq!(loaded.version(), 1);
    assert!(loaded.inner().placed);
}

#[tokio::test]
async fn unreadable_historical_event_halts_the_load() {
    let store = InMemoryStore::new();

    store
        .append(
            "order-47",
            0,
            vec![
                order_paid(1),
                chorus::message::Event::new("SomethingElse", "orders", serde_json::json!({}))
                    .unwrap(),
            ],
        )
        .await
        .unwrap();

    // The first event folds (payment on an unplaced order is a domain rule,
    // not a replay rule); the second cannot be interpreted at all.
    let error = repository(&store).load("47").await.unwrap_err();
    match error {
        RepositoryError::Corrupted {
            stream_key,
            version,
            ..
        } => {
            assert_eq!(stream_key, "order-47");
            assert_eq!(version, 2);
        }
        other => panic!("expected replay corruption, got {other:?}"),
    }
}

#[tokio::test]
async fn snapshot_policy_captures_state_as_versions_cross_the_threshold() {
    let store = InMemoryStore::new();
    let repository = Repository::<Order, _>::new(store.clone()).snapshot_every(2);

    let mut state = repository.load("48").await.unwrap();
    repository
        .handle_command(&mut state, OrderCommand::Place { amount: 10 })
        .await
        .unwrap();
    assert!(store.load_snapshot("order-48").await.unwrap().is_none());

    repository
        .handle_command(&mut state, OrderCommand::Pay { amount: 4 })
        .await
        .unwrap();

    let snapshot = store.load_snapshot("order-48").await.unwrap().unwrap();
    assert_eq!(snapshot.version, 2);

    let captured: OrderState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(captured, *state.inner());
}

#[tokio::test]
async fn manual_record_and_save_clear_uncommitted_events() {
    let store = InMemoryStore::new();
    let repository = repository(&store);

    let mut state: AggregateState<OrderState> = repository.load("49").await.unwrap();
    state.record(chorus::message::Event::new("OrderPlaced", "orders", serde_json::json!({"amount": 3})).unwrap());
    assert_eq!(state.uncommitted().len(), 1);

    let version = repository.save(&mut state).await.unwrap();
    assert_eq!(version, 1);
    assert!(state.uncommitted().is_empty());

    // Saving with nothing recorded is a no-op.
    let version = repository.save(&mut state).await.unwrap();
    assert_eq!(version, 1);
}
