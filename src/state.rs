use crate::message::Event;
use crate::Version;

/// The in-memory representation of an aggregate instance: its key, the
/// stream version it was loaded at, and the events recorded since.
///
/// Lifecycle: constructed empty, rebuilt by folding historical events in
/// order, mutated by business operations that [`record`](AggregateState::record)
/// new events, then persisted by the repository, which drains the recorded
/// events and bumps the version.
#[derive(Debug, Clone)]
pub struct AggregateState<S> {
    key: String,
    version: Version,
    uncommitted: Vec<Event>,
    inner: S,
}

impl<S: Default> AggregateState<S> {
    /// An empty instance at version 0, from which a full replay starts.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: 0,
            uncommitted: vec![],
            inner: Default::default(),
        }
    }
}

impl<S> AggregateState<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The version of the last event folded into `inner`. Uncommitted events
    /// are not counted until the repository persists them.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn set_inner(&mut self, inner: S) -> &mut Self {
        self.inner = inner;
        self
    }

    /// The events produced since the last load/save, in production order.
    pub fn uncommitted(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Records an event produced by a business operation. The event is held
    /// here until the repository persists it.
    pub fn record(&mut self, event: Event) -> &mut Self {
        self.uncommitted.push(event);
        self
    }

    pub(crate) fn set_version(&mut self, version: Version) -> &mut Self {
        self.version = version;
        self
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.uncommitted)
    }
}
