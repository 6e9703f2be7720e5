use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use crate::message::Event;
use crate::store::{EventStore, Snapshot, StoreError, StoreEvent};
use crate::Version;

/// In-process implementation of the [`EventStore`]. Use this struct in order
/// to have a pre-made implementation of an [`EventStore`] keeping every
/// stream in memory: the reference backend for tests, demos and
/// single-process deployments.
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference.
///
/// Concurrent `append`s against the same stream are serialized by the
/// expected-version check under a single write guard, so at most one writer
/// succeeds per version; callers never take locks.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    streams: RwLock<HashMap<String, Stream>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

#[derive(Default)]
struct Stream {
    version: Version,
    events: Vec<StoreEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned guard only means a panic elsewhere while holding the lock;
    // the map itself is still usable.
    fn streams(&self) -> RwLockReadGuard<'_, HashMap<String, Stream>> {
        self.inner.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Stream>> {
        self.inner.streams.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    #[tracing::instrument(skip_all, fields(stream_key = %stream_key, expected = expected_version), err)]
    async fn append(
        &self,
        stream_key: &str,
        expected_version: Version,
        events: Vec<Event>,
    ) -> Result<Version, StoreError> {
        let mut streams = self.streams_mut();
        let stream = streams.entry(stream_key.to_owned()).or_default();

        if stream.version != expected_version {
            return Err(StoreError::Conflict {
                stream_key: stream_key.to_owned(),
                expected: expected_version,
                actual: stream.version,
            });
        }

        let mut sequence_number: Version = stream.version;
        let store_events: Vec<StoreEvent> = events
            .into_iter()
            .map(|event| {
                sequence_number += 1;
                StoreEvent {
                    stream_key: stream_key.to_owned(),
                    sequence_number,
                    event,
                }
            })
            .collect();

        stream.events.extend(store_events);
        stream.version = sequence_number;
        Ok(stream.version)
    }

    fn stream(
        &self,
        stream_key: &str,
        from_version: Version,
    ) -> BoxStream<'_, Result<StoreEvent, StoreError>> {
        let tail: Vec<StoreEvent> = self
            .streams()
            .get(stream_key)
            .map(|stream| {
                stream
                    .events
                    .iter()
                    .filter(|store_event| store_event.sequence_number > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        stream::iter(tail.into_iter().map(Ok)).boxed()
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self
            .inner
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        snapshots.insert(snapshot.stream_key.clone(), snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, stream_key: &str) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self
            .inner
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots.get(stream_key).cloned())
    }
}

/// Debug implementation for [`InMemoryStore`]. It just shows the stream keys
/// and their versions, that are the only thing that might be useful to debug.
impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let streams = self.streams();
        let mut map = f.debug_map();
        for (stream_key, stream) in streams.iter() {
            map.entry(stream_key, &stream.version);
        }
        map.finish()
    }
}
