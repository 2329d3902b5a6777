use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Application code receiving payloads for a channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn on_message(&self, sender: SocketAddr, channel_id: u8, payload: &[u8]);
}

/// Routes received payloads to the handler registered for their channel, falling back to an
///  'unhandled' handler for channels without one.
#[derive(Default)]
pub struct ChannelDispatcher {
    handlers: RwLock<FxHashMap<u8, Arc<dyn ChannelHandler>>>,
    unhandled: RwLock<Option<Arc<dyn ChannelHandler>>>,
}

impl ChannelDispatcher {
    pub fn new() -> ChannelDispatcher {
        Default::default()
    }

    /// returns the previously registered handler
    pub fn register(&self, channel_id: u8, handler: Arc<dyn ChannelHandler>) -> Option<Arc<dyn ChannelHandler>> {
        debug!("registering handler for channel {}", channel_id);
        self.handlers.write()
            .expect("lock is poisoned")
            .insert(channel_id, handler)
    }

    pub fn remove(&self, channel_id: u8) -> Option<Arc<dyn ChannelHandler>> {
        debug!("removing handler for channel {}", channel_id);
        self.handlers.write()
            .expect("lock is poisoned")
            .remove(&channel_id)
    }

    pub fn set_unhandled(&self, handler: Option<Arc<dyn ChannelHandler>>) {
        *self.unhandled.write().expect("lock is poisoned") = handler;
    }

    pub fn has_handler(&self, channel_id: u8) -> bool {
        self.handlers.read()
            .expect("lock is poisoned")
            .contains_key(&channel_id)
    }

    pub async fn dispatch(&self, sender: SocketAddr, channel_id: u8, payload: &[u8]) {
        let handler = self.handlers.read()
            .expect("lock is poisoned")
            .get(&channel_id)
            .cloned()
            .or_else(|| self.unhandled.read().expect("lock is poisoned").clone());

        match handler {
            Some(handler) => {
                trace!("dispatching {} bytes from {:?} on channel {}", payload.len(), sender, channel_id);
                handler.on_message(sender, channel_id, payload).await;
            }
            None => {
                debug!("no handler for channel {} - dropping {} bytes from {:?}", channel_id, payload.len(), sender);
            }
        }
    }
}
