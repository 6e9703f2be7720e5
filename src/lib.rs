//! An event-sourcing and orchestration core.
//!
//! State lives in append-only event streams with optimistic concurrency and
//! optional snapshots ([`store`]), aggregates are rebuilt by replaying their
//! stream ([`repository`]), commands and events are routed between decoupled
//! handlers over a kind-keyed bus ([`bus`]), and multi-aggregate business
//! transactions run as checkpointed sagas with explicit compensation
//! ([`saga`]). Independent units wire themselves in through [`module`].

pub use crate::aggregate::Aggregate;
pub use crate::state::AggregateState;

pub mod bus;
pub mod message;
pub mod module;
pub mod repository;
pub mod saga;
pub mod store;

mod aggregate;
mod state;

/// The version of an event stream: the number of events ever appended to it.
///
/// Doubles as the sequence number of the latest event, since versions only
/// ever increase and streams are never reordered or truncated.
pub type Version = u64;
