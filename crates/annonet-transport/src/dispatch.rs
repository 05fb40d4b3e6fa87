//! Routes completed envelopes to the handler registered for their type.

use std::future::Future;
use std::sync::Arc;

use annonet_core::{Envelope, MessageType};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

/// Bytes of payload shown when logging an unhandled message.
const PREVIEW_LEN: usize = 32;

/// Reacts to one message type. Any `Fn(Envelope) -> impl Future` closure
/// qualifies.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, anyhow::Result<()>> {
        (self)(envelope).boxed()
    }
}

/// At most one handler per message type. Cheap to clone; clones share the
/// same table.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<DashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_type`, replacing any earlier one.
    /// Returns true if a handler was replaced.
    pub fn register(&self, msg_type: MessageType, handler: impl MessageHandler) -> bool {
        let replaced = self.handlers.insert(msg_type, Arc::new(handler)).is_some();
        tracing::debug!(%msg_type, replaced, "handler registered");
        replaced
    }

    /// Returns false if nothing was registered.
    pub fn unregister(&self, msg_type: MessageType) -> bool {
        self.handlers.remove(&msg_type).is_some()
    }

    pub fn is_registered(&self, msg_type: MessageType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Run the handler for the envelope's type. Handler errors are logged,
    /// never propagated. Returns false if no handler is registered.
    pub async fn dispatch(&self, envelope: Envelope) -> bool {
        // Clone out so the map shard is not locked across the await.
        let handler = self
            .handlers
            .get(&envelope.msg_type)
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            let preview = &envelope.payload[..envelope.payload.len().min(PREVIEW_LEN)];
            tracing::info!(
                msg_type = %envelope.msg_type,
                len = envelope.payload.len(),
                preview = hex::encode(preview),
                "no handler registered, dropping message"
            );
            return false;
        };

        let msg_type = envelope.msg_type;
        if let Err(e) = handler.handle(envelope).await {
            tracing::warn!(%msg_type, error = %e, "message handler failed");
        }
        true
    }
}
