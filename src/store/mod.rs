use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::message::Event;
use crate::Version;

pub mod memory;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The optimistic concurrency check failed: the stream moved past the
    /// expected version. Retryable by re-loading and re-applying.
    #[error("version conflict on stream {stream_key}: expected {expected}, found {actual}")]
    Conflict {
        stream_key: String,
        expected: Version,
        actual: Version,
    },
    /// Serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error raised by the concrete storage backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A persisted event alongside its position within its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    /// The stream the event was appended to.
    pub stream_key: String,
    /// The position of the event within its stream, starting at 1.
    pub sequence_number: Version,
    /// The original, emitted, event.
    pub event: Event,
}

impl StoreEvent {
    /// Returns the position of the event within its stream.
    pub const fn sequence_number(&self) -> Version {
        self.sequence_number
    }

    /// Returns the original, emitted, event.
    pub const fn event(&self) -> &Event {
        &self.event
    }
}

/// A cached aggregate state at a given version.
///
/// Snapshots only shorten replay; loading must produce identical state with
/// or without them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_key: String,
    /// The stream version the state was captured at.
    pub version: Version,
    /// The serialized aggregate state.
    pub state: serde_json::Value,
    pub captured_on: DateTime<Utc>,
}

/// An `EventStore` is responsible for persisting the events that an aggregate
/// emits into an append-only, per-stream log, and for loading the events that
/// represent a stream's history back out, in append order.
///
/// The store never publishes: after a successful [`append`](EventStore::append)
/// it is the caller's job to put the same events on the bus, keeping
/// persistence decoupled from delivery.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to the stream iff its current version equals
    /// `expected_version`, returning the new version. All-or-nothing: on a
    /// [`StoreError::Conflict`] nothing is appended.
    async fn append(
        &self,
        stream_key: &str,
        expected_version: Version,
        events: Vec<Event>,
    ) -> Result<Version, StoreError>;

    /// Streams the events recorded strictly after `from_version`, in append
    /// order. Lazy and restartable; an unknown stream key yields an empty
    /// stream, not an error.
    fn stream(
        &self,
        stream_key: &str,
        from_version: Version,
    ) -> BoxStream<'_, Result<StoreEvent, StoreError>>;

    /// Persists a snapshot. Independent of event appends: a store that loses
    /// every snapshot is still correct.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Returns the latest snapshot for the stream, if any was ever saved.
    async fn load_snapshot(&self, stream_key: &str) -> Result<Option<Snapshot>, StoreError>;
}

/// Blanket implementation making an [`EventStore`] of every (smart) pointer
/// to an [`EventStore`], e.g. `&Store`, `Box<Store>`, `Arc<Store>`.
/// This is particularly useful when there's the need in your codebase to have
/// a generic [`EventStore`] shared between repositories and modules.
#[async_trait]
impl<T, S> EventStore for T
where
    S: EventStore + ?Sized + 'static,
    T: Deref<Target = S> + Send + Sync,
{
    /// Deref call to [`EventStore::append`].
    async fn append(
        &self,
        stream_key: &str,
        expected_version: Version,
        events: Vec<Event>,
    ) -> Result<Version, StoreError> {
        self.deref().append(stream_key, expected_version, events).await
    }

    /// Deref call to [`EventStore::stream`].
    fn stream(
        &self,
        stream_key: &str,
        from_version: Version,
    ) -> BoxStream<'_, Result<StoreEvent, StoreError>> {
        self.deref().stream(stream_key, from_version)
    }

    /// Deref call to [`EventStore::save_snapshot`].
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.deref().save_snapshot(snapshot).await
    }

    /// Deref call to [`EventStore::load_snapshot`].
    async fn load_snapshot(&self, stream_key: &str) -> Result<Option<Snapshot>, StoreError> {
        self.deref().load_snapshot(stream_key).await
    }
}
