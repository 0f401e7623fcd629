use crate::core::errors::StreamError;
use crate::core::types::InboundMessage;
use crate::stream::hooks::{panic_message, StreamHooks};
use crate::stream::registry::Registry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::trace;

/// Routes decoded messages to subscription callbacks.
///
/// Delivery is synchronous on the stream task, in the order messages were
/// read. A callback that blocks stalls the read loop; one that panics is
/// reported through `on_error` and the next callback still runs.
pub struct Dispatcher {
    registry: Arc<Registry>,
    hooks: StreamHooks,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, hooks: StreamHooks) -> Self {
        Self { registry, hooks }
    }

    /// Deliver one message. Returns the number of callbacks that completed.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        // Cloned out so callbacks can (un)subscribe without deadlocking
        let callbacks = self.registry.callbacks_for(&message.route);
        if callbacks.is_empty() {
            trace!(route = %message.route, "no subscriber");
            return 0;
        }

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&message.payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let err = StreamError::CallbackError {
                        topic: format!("{} ({})", message.route, id),
                        message: panic_message(panic.as_ref()),
                    };
                    self.hooks.emit_error(&err);
                }
            }
        }
        delivered
    }
}
