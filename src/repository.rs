use std::marker::PhantomData;

use chrono::Utc;
use futures::TryStreamExt;

use crate::aggregate::Aggregate;
use crate::state::AggregateState;
use crate::store::{EventStore, Snapshot, StoreError, StoreEvent};
use crate::Version;

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError<E: std::error::Error> {
    /// Store-level failure. A [`StoreError::Conflict`] in here is expected
    /// and retryable; everything else is infrastructure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A historical event the current aggregate logic cannot fold. Fatal:
    /// loading halts rather than producing a partially-folded aggregate.
    #[error("replay of stream {stream_key} halted at version {version}: {source}")]
    Corrupted {
        stream_key: String,
        version: Version,
        #[source]
        source: E,
    },
    /// The aggregate rejected the command.
    #[error(transparent)]
    Domain(E),
}

impl<E: std::error::Error> RepositoryError<E> {
    /// True for an optimistic-concurrency conflict, to be retried with a
    /// fresh [`Repository::load`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }
}

/// The `Repository` is responsible for coupling an [`Aggregate`] with a
/// store, so that its events can be persisted when commands are handled, and
/// its state can be reconstructed by loading and applying events
/// sequentially.
pub struct Repository<A, S>
where
    A: Aggregate,
    S: EventStore,
{
    store: S,
    snapshot_every: Option<Version>,
    _aggregate: PhantomData<A>,
}

impl<A, S> Repository<A, S>
where
    A: Aggregate,
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            snapshot_every: None,
            _aggregate: PhantomData,
        }
    }

    /// Writes a snapshot whenever a save crosses a multiple of `every`
    /// events. Snapshots only shorten replay: a failed snapshot write is
    /// logged and the save still succeeds.
    pub fn snapshot_every(mut self, every: Version) -> Self {
        self.snapshot_every = Some(every.max(1));
        self
    }

    /// Returns the internal event store
    pub fn store(&self) -> &S {
        &self.store
    }

    fn stream_key(key: &str) -> String {
        format!("{}-{}", A::NAME, key)
    }

    /// Loads an aggregate instance, starting from the latest snapshot when
    /// one exists and replaying the events recorded after it, in strict
    /// append order. Without a snapshot the replay starts from the zero
    /// state. A snapshot whose state no longer deserializes is skipped with
    /// a warning; the result is the same either way.
    pub async fn load(&self, key: &str) -> Result<AggregateState<A::State>, RepositoryError<A::Error>> {
        let stream_key: String = Self::stream_key(key);

        let mut inner: A::State = Default::default();
        let mut version: Version = 0;

        if let Some(snapshot) = self.store.load_snapshot(&stream_key).await? {
            match serde_json::from_value::<A::State>(snapshot.state) {
                Ok(state) => {
                    inner = state;
                    version = snapshot.version;
                }
                Err(error) => {
                    tracing::warn!(
                        stream_key = %stream_key,
                        error = %error,
                        "undecodable snapshot state, falling back to full replay"
                    );
                }
            }
        }

        let mut events = self.store.stream(&stream_key, version);
        while let Some(store_event) = events.try_next().await? {
            inner = A::apply_event(inner, store_event.event()).map_err(|source| {
                RepositoryError::Corrupted {
                    stream_key: stream_key.clone(),
                    version: store_event.sequence_number(),
                    source,
                }
            })?;
            version = store_event.sequence_number();
        }

        let mut state = AggregateState::new(key);
        state.set_inner(inner).set_version(version);
        Ok(state)
    }

    /// Persists the aggregate's uncommitted events, expecting the stream to
    /// still be at the version the aggregate was loaded at. On success the
    /// uncommitted list is cleared and the version bumped. On a conflict the
    /// state is left untouched and the error surfaced: the caller retries
    /// with a fresh [`Repository::load`].
    #[tracing::instrument(skip_all, fields(aggregate = A::NAME, key = %state.key()), err)]
    pub async fn save(
        &self,
        state: &mut AggregateState<A::State>,
    ) -> Result<Version, RepositoryError<A::Error>> {
        if state.uncommitted().is_empty() {
            return Ok(state.version());
        }

        let stream_key: String = Self::stream_key(state.key());
        let previous: Version = state.version();
        let events: Vec<_> = state.uncommitted().to_vec();

        let new_version: Version = self.store.append(&stream_key, previous, events).await?;

        state.take_uncommitted();
        state.set_version(new_version);

        self.maybe_snapshot(&stream_key, previous, state).await;
        Ok(new_version)
    }

    /// Validates and handles the command onto the given state, folds the
    /// resulting events onto it, records them, and passes them to the store.
    ///
    /// The caller is responsible for publishing the persisted events on the
    /// bus afterwards; the store itself never publishes.
    pub async fn handle_command(
        &self,
        state: &mut AggregateState<A::State>,
        command: A::Command,
    ) -> Result<Vec<StoreEvent>, RepositoryError<A::Error>> {
        let events = A::handle_command(state.inner(), command).map_err(RepositoryError::Domain)?;

        for event in events {
            let folded = A::apply_event(state.inner().clone(), &event)
                .map_err(RepositoryError::Domain)?;
            state.set_inner(folded).record(event);
        }

        let previous: Version = state.version();
        let recorded: Vec<_> = state.uncommitted().to_vec();
        self.save(state).await?;

        // Rebuild the persisted view of what was just appended; positions
        // are knowable from the pre-save version.
        let stream_key: String = Self::stream_key(state.key());
        Ok(recorded
            .into_iter()
            .enumerate()
            .map(|(index, event)| StoreEvent {
                stream_key: stream_key.clone(),
                sequence_number: previous + index as Version + 1,
                event,
            })
            .collect())
    }

    async fn maybe_snapshot(
        &self,
        stream_key: &str,
        previous: Version,
        state: &AggregateState<A::State>,
    ) {
        let Some(every) = self.snapshot_every else {
            return;
        };
        if state.version() / every == previous / every {
            return;
        }

        let value = match serde_json::to_value(state.inner()) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    stream_key = %stream_key,
                    error = %error,
                    "aggregate state not snapshottable, continuing without"
                );
                return;
            }
        };

        let snapshot = Snapshot {
            stream_key: stream_key.to_owned(),
            version: state.version(),
            state: value,
            captured_on: Utc::now(),
        };

        if let Err(error) = self.store.save_snapshot(snapshot).await {
            tracing::warn!(
                stream_key = %stream_key,
                error = %error,
                "snapshot write failed, continuing without"
            );
        }
    }
}
