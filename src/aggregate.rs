use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::Event;

/// An `Aggregate` is a consistency boundary whose state is derived entirely
/// from its own event stream. It is responsible for validating commands,
/// mapping commands to events, and folding events back onto its state.
///
/// Both functions are pure: commands are handled against a borrowed state and
/// the fold consumes and returns state, so replay never suspends and never
/// touches a store.
pub trait Aggregate {
    /// The stream-key namespace for instances of this aggregate, e.g.
    /// `"order"`. An instance with key `"1"` lives in stream `"order-1"`.
    const NAME: &'static str;

    /// Internal aggregate state. Serde bounds exist so snapshots can capture
    /// it; `Default` is the zero-value a full replay starts from.
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync;

    /// The intents this aggregate handles.
    type Command: Send;

    /// Error for rejected commands and for historical events the current
    /// logic cannot interpret.
    type Error: std::error::Error + Send + Sync;

    /// Validates and handles the command onto the given state, returning the
    /// events it gives rise to. Nothing is partially applied: either the
    /// command is rejected, or every emitted event is valid.
    fn handle_command(state: &Self::State, command: Self::Command)
        -> Result<Vec<Event>, Self::Error>;

    /// Updates the aggregate state using the given event.
    ///
    /// A payload this aggregate cannot fold must surface an error: replay
    /// halts instead of producing a partially-folded state.
    fn apply_event(state: Self::State, event: &Event) -> Result<Self::State, Self::Error>;
}
