//! Connection lifecycle hooks.

use crate::connection::ConnectionChannel;
use std::sync::RwLock;
use tracing::warn;

type CloseHandler = Box<dyn Fn(&ConnectionChannel) + Send + Sync>;

/// Registry of close observers. `ConnectionChannel::close` fires every
/// registered handler exactly once per connection, no matter how many times
/// close is attempted.
#[derive(Default)]
pub struct NetEvents {
    close_handlers: RwLock<Vec<CloseHandler>>,
}

impl NetEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for connection close. Handlers must not block;
    /// anything slow should be spawned.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&ConnectionChannel) + Send + Sync + 'static,
    {
        match self.close_handlers.write() {
            Ok(mut handlers) => handlers.push(Box::new(handler)),
            Err(_) => warn!("close handler registry poisoned, handler dropped"),
        }
    }

    pub(crate) fn fire_close(&self, channel: &ConnectionChannel) {
        if let Ok(handlers) = self.close_handlers.read() {
            for handler in handlers.iter() {
                handler(channel);
            }
        }
    }
}

impl std::fmt::Debug for NetEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .close_handlers
            .read()
            .map(|h| h.len())
            .unwrap_or_default();
        f.debug_struct("NetEvents")
            .field("close_handlers", &count)
            .finish()
    }
}
