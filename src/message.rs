use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Domain constraints are checked when an envelope is built: either a valid,
/// immutable message comes out, or one of these. There is no partially
/// constructed message to observe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message kind must not be empty")]
    EmptyKind,
    #[error("message source must not be empty")]
    EmptySource,
}

fn validate(kind: &str, source: &str) -> Result<(), ValidationError> {
    if kind.is_empty() {
        return Err(ValidationError::EmptyKind);
    }
    if source.is_empty() {
        return Err(ValidationError::EmptySource);
    }
    Ok(())
}

/// An intent to change state.
///
/// Commands travel on the bus but are never persisted in the event store.
/// The wire shape is CloudEvents-compatible: `{id, type, source, time}` plus
/// the variant-specific `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: Uuid,
    #[serde(rename = "type")]
    kind: String,
    source: String,
    time: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

impl Command {
    /// Kind tag used when the caller does not supply one.
    pub const DEFAULT_KIND: &'static str = "Command";

    pub fn new(
        kind: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self, ValidationError> {
        let kind: String = kind.into();
        let source: String = source.into();
        validate(&kind, &source)?;

        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            source,
            time: Utc::now(),
            payload,
        })
    }

    /// Builds a command tagged with [`Command::DEFAULT_KIND`].
    pub fn with_default_kind(
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self, ValidationError> {
        Self::new(Self::DEFAULT_KIND, source, payload)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// An immutable fact.
///
/// Events are persisted in the event store, never mutated after creation,
/// and ordered within their stream. Same CloudEvents-compatible wire shape
/// as [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    #[serde(rename = "type")]
    kind: String,
    source: String,
    time: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

impl Event {
    /// Kind tag used when the caller does not supply one.
    pub const DEFAULT_KIND: &'static str = "Event";

    pub fn new(
        kind: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self, ValidationError> {
        let kind: String = kind.into();
        let source: String = source.into();
        validate(&kind, &source)?;

        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            source,
            time: Utc::now(),
            payload,
        })
    }

    /// Builds an event tagged with [`Event::DEFAULT_KIND`].
    pub fn with_default_kind(
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self, ValidationError> {
        Self::new(Self::DEFAULT_KIND, source, payload)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Anything travelling on the bus: either an intent or a fact.
///
/// The bus dispatches on [`Message::kind`] alone; handlers that care about
/// the variant match on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Message {
    Command(Command),
    Event(Event),
}

impl Message {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Command(command) => command.id(),
            Self::Event(event) => event.id(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Command(command) => command.kind(),
            Self::Event(event) => event.kind(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Command(command) => command.source(),
            Self::Event(event) => event.source(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Command(command) => command.time(),
            Self::Event(event) => event.time(),
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Command(command) => command.payload(),
            Self::Event(event) => event.payload(),
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}
