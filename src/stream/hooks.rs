use crate::core::errors::StreamError;
use crate::core::types::ConnectionState;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&StreamError) + Send + Sync>;
pub type StateHook = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type ReconnectHook = Arc<dyn Fn(u32) + Send + Sync>;

/// User lifecycle callbacks. Every hook runs on the stream task and is
/// panic-isolated: a panicking hook is logged and otherwise ignored.
#[derive(Clone, Default)]
pub struct StreamHooks {
    pub(crate) on_open: Option<LifecycleHook>,
    pub(crate) on_close: Option<LifecycleHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_state_change: Option<StateHook>,
    pub(crate) on_reconnect: Option<ReconnectHook>,
}

impl std::fmt::Debug for StreamHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .finish()
    }
}

impl StreamHooks {
    pub fn emit_open(&self) {
        if let Some(hook) = &self.on_open {
            guarded("on_open", || hook());
        }
    }

    pub fn emit_close(&self) {
        if let Some(hook) = &self.on_close {
            guarded("on_close", || hook());
        }
    }

    pub fn emit_error(&self, err: &StreamError) {
        error!(error = %err, "stream error");
        if let Some(hook) = &self.on_error {
            guarded("on_error", || hook(err));
        }
    }

    pub fn emit_state_change(&self, state: ConnectionState) {
        if let Some(hook) = &self.on_state_change {
            guarded("on_state_change", || hook(state));
        }
    }

    pub fn emit_reconnect(&self, attempt: u32) {
        if let Some(hook) = &self.on_reconnect {
            guarded("on_reconnect", || hook(attempt));
        }
    }
}

fn guarded(name: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(hook = name, panic = %panic_message(panic.as_ref()), "hook panicked");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Single-writer connection state shared with any number of readers.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next` and fire `on_state_change` once. Returns `false` when
    /// the state is unchanged or already `Closed`, which is terminal.
    pub fn transition(&self, next: ConnectionState, hooks: &StreamHooks) -> bool {
        let mut previous = next;
        let changed = self.tx.send_if_modified(|current| {
            if *current == next || current.is_closed() {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });

        if changed {
            debug!(from = %previous, to = %next, "connection state");
            hooks.emit_state_change(next);
        }
        changed
    }
}
