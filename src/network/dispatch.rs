//! Steady-state message stage
//!
//! Splits the inbound stream into frames, decodes them and hands each
//! message to whatever consumer is installed at that moment.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::pipeline::{Inbound, Stage, StageContext, StageEvent};
use crate::protocol::message::{frame_length, Message, SignatureCache};

/// Receives every decoded inbound message, on the worker thread.
pub trait MessageConsumer: Send + Sync {
    fn on_message(&self, message: Message);
}

impl<F> MessageConsumer for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl MessageConsumer for Discard {
    fn on_message(&self, _message: Message) {}
}

/// Consumer reference that can be replaced while messages flow.
#[derive(Clone)]
pub struct SwappableConsumer {
    current: Arc<RwLock<Arc<dyn MessageConsumer>>>,
}

impl Default for SwappableConsumer {
    fn default() -> Self {
        Self::new(Arc::new(Discard))
    }
}

impl SwappableConsumer {
    pub fn new(initial: Arc<dyn MessageConsumer>) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
        }
    }

    /// Install `next`, returning the previous consumer.
    pub fn swap(&self, next: Arc<dyn MessageConsumer>) -> Arc<dyn MessageConsumer> {
        std::mem::replace(&mut *self.current.write(), next)
    }

    pub fn deliver(&self, message: Message) {
        // Clone out so a consumer may swap itself without deadlocking.
        let consumer = Arc::clone(&*self.current.read());
        consumer.on_message(message);
    }
}

pub struct MessageStage {
    connection: usize,
    consumer: SwappableConsumer,
    signatures: Arc<SignatureCache>,
    max_message_size: usize,
}

impl MessageStage {
    pub const NAME: &'static str = "messages";

    pub fn new(
        connection: usize,
        consumer: SwappableConsumer,
        signatures: Arc<SignatureCache>,
        max_message_size: usize,
    ) -> Self {
        Self {
            connection,
            consumer,
            signatures,
            max_message_size,
        }
    }
}

impl Stage for MessageStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle_inbound(&mut self, input: &[u8], ctx: &mut StageContext) -> Inbound {
        let total = match frame_length(input) {
            Ok(Some(total)) => total,
            Ok(None) => return Inbound::Consumed(0),
            Err(e) => {
                ctx.emit(StageEvent::Fatal(format!("unreadable frame header: {e}")));
                ctx.halt();
                return Inbound::Consumed(0);
            }
        };
        if total > self.max_message_size {
            ctx.emit(StageEvent::Fatal(format!(
                "frame of {total} bytes exceeds limit of {}",
                self.max_message_size
            )));
            ctx.halt();
            return Inbound::Consumed(0);
        }
        if total > input.len() {
            return Inbound::Consumed(0);
        }

        match Message::decode_cached(&input[..total], &self.signatures) {
            Ok(message) => self.consumer.deliver(message),
            Err(e) => warn!(
                connection = self.connection,
                error = %e,
                len = total,
                "dropping undecodable message"
            ),
        }
        Inbound::Consumed(total)
    }
}
