use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tracing::Instrument;

use crate::message::Message;

/// Opaque error raised by a handler or transport while processing a message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// This trait is used to implement a `MessageHandler`: an entity subscribed
/// to a message kind that updates a read side, drives a saga, or performs a
/// side effect when a matching message is delivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message and perform an action. Failures are isolated by the
    /// bus: they never prevent the remaining handlers from being invoked.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;

    /// The name of the message handler. By default, this is the type name of
    /// the handler, but it can be overridden to provide a custom name. This
    /// name is used in delivery reports and tracing spans, to identify the
    /// handler being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The responsibility of the `Transport` trait is to hand a message over to a
/// cross-process delivery mechanism (a queue, a log, a pub/sub service).
///
/// The bus owns dispatch order and failure isolation; a transport only
/// acknowledges or fails the hand-over.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message for cross-process delivery, returning once the
    /// transport acknowledged it.
    async fn publish(&self, message: &Message) -> Result<(), HandlerError>;

    /// The name of the transport, used in delivery reports and tracing
    /// spans. By default, the type name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A single handler's failure, wrapped with the message kind and the handler
/// identity it originated from.
#[derive(Debug, thiserror::Error)]
#[error("handler {handler} failed handling {kind}: {source}")]
pub struct HandlerFailure {
    /// Kind of the message being delivered.
    pub kind: String,
    /// Identity of the failing handler or transport.
    pub handler: &'static str,
    #[source]
    pub source: HandlerError,
}

/// The aggregate failure report of a publish.
///
/// Every handler (and transport) was attempted before this is returned; the
/// report carries the ones that failed, in registration order. Fail loud
/// after full delivery attempt, not fail fast.
#[derive(Debug, thiserror::Error)]
#[error("{} of {} deliveries failed for {}", .failures.len(), .attempted, .kind)]
pub struct DeliveryError {
    pub kind: String,
    /// How many handlers and transports were invoked.
    pub attempted: usize,
    pub failures: Vec<HandlerFailure>,
}

/// A type-keyed subscription registry routing messages to handlers.
///
/// Dispatch is a table lookup on [`Message::kind`]; for a given kind,
/// handlers run in registration order. The registry is only mutated during
/// setup (`&mut self`), so steady-state dispatch takes no locks. There is no
/// built-in retry or dead-lettering: that is a saga-level or caller-level
/// responsibility.
#[derive(Default)]
pub struct MessageBus {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a message kind. A kind may have any number
    /// of handlers; they are invoked in the order they were registered.
    pub fn subscribe(&mut self, kind: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.handlers.entry(kind.into()).or_default().push(Arc::new(handler));
    }

    /// Attaches a cross-process transport. Every published message is handed
    /// to every transport after local delivery; transport failures join the
    /// same delivery report.
    pub fn attach_transport(&mut self, transport: impl Transport + 'static) {
        self.transports.push(Arc::new(transport));
    }

    /// Number of handlers currently registered for `kind`.
    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.handlers.get(kind).map_or(0, Vec::len)
    }

    /// Synchronous delivery: invokes each handler registered for the
    /// message's kind in registration order, on the caller's control flow.
    ///
    /// A failing handler never prevents the remaining ones from running;
    /// each failure is wrapped with the message kind and handler identity
    /// and the whole report is returned once every delivery was attempted.
    pub async fn publish(&self, message: &Message) -> Result<(), DeliveryError> {
        let mut attempted: usize = 0;
        let mut failures: Vec<HandlerFailure> = vec![];

        for handler in self.handlers.get(message.kind()).into_iter().flatten() {
            attempted += 1;
            let span = tracing::debug_span!(
                "chorus.handler",
                kind = message.kind(),
                handler = handler.name()
            );

            if let Err(source) = handler.handle(message).instrument(span).await {
                tracing::error!(
                    kind = message.kind(),
                    handler = handler.name(),
                    error = ?source,
                    "message handler failed to handle message"
                );
                failures.push(HandlerFailure {
                    kind: message.kind().to_owned(),
                    handler: handler.name(),
                    source,
                });
            }
        }

        self.forward(message, &mut attempted, &mut failures).await;
        Self::report(message, attempted, failures)
    }

    /// Asynchronous delivery: every handler registered for the message's
    /// kind runs as an independently schedulable unit of work.
    ///
    /// Delivery to all handlers is attempted regardless of failures; the
    /// report lists failures in registration order. No invocation-order
    /// guarantee is given in this mode.
    pub async fn publish_concurrent(&self, message: &Message) -> Result<(), DeliveryError> {
        let handlers = self.handlers.get(message.kind()).into_iter().flatten();

        let outcomes = future::join_all(handlers.map(|handler| async move {
            handler.handle(message).await.map_err(|source| {
                tracing::error!(
                    kind = message.kind(),
                    handler = handler.name(),
                    error = ?source,
                    "message handler failed to handle message"
                );
                HandlerFailure {
                    kind: message.kind().to_owned(),
                    handler: handler.name(),
                    source,
                }
            })
        }))
        .await;

        let mut attempted: usize = outcomes.len();
        let mut failures: Vec<HandlerFailure> =
            outcomes.into_iter().filter_map(Result::err).collect();

        self.forward(message, &mut attempted, &mut failures).await;
        Self::report(message, attempted, failures)
    }

    /// Hands the message to every attached transport, concurrently.
    async fn forward(
        &self,
        message: &Message,
        attempted: &mut usize,
        failures: &mut Vec<HandlerFailure>,
    ) {
        if self.transports.is_empty() {
            return;
        }

        let outcomes = future::join_all(self.transports.iter().map(|transport| async move {
            transport.publish(message).await.map_err(|source| {
                tracing::error!(
                    kind = message.kind(),
                    transport = transport.name(),
                    error = ?source,
                    "transport failed to publish message"
                );
                HandlerFailure {
                    kind: message.kind().to_owned(),
                    handler: transport.name(),
                    source,
                }
            })
        }))
        .await;

        *attempted += outcomes.len();
        failures.extend(outcomes.into_iter().filter_map(Result::err));
    }

    fn report(
        message: &Message,
        attempted: usize,
        failures: Vec<HandlerFailure>,
    ) -> Result<(), DeliveryError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeliveryError {
                kind: message.kind().to_owned(),
                attempted,
                failures,
            })
        }
    }
}
