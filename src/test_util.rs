//! Utilities for testing code that uses JuiceNet endpoints. They are part of the regular crate
//!  so that applications can use them in their own tests.

use crate::config::{JuiceNetConfig, RetryConfig};
use crate::dispatcher::ChannelHandler;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: SocketAddr,
    pub channel_id: u8,
    pub payload: Vec<u8>,
}

/// A [ChannelHandler] that records everything it receives
#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<ReceivedMessage>>,
}

impl RecordingHandler {
    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.received.lock()
            .expect("lock is poisoned")
            .clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received().into_iter()
            .map(|m| m.payload)
            .collect()
    }

    /// Waits until at least `num_messages` were received or the timeout expires, returning
    ///  whatever was received
    pub async fn wait_for(&self, num_messages: usize, timeout: Duration) -> Vec<ReceivedMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let received = self.received();
            if received.len() >= num_messages || Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ChannelHandler for RecordingHandler {
    async fn on_message(&self, sender: SocketAddr, channel_id: u8, payload: &[u8]) {
        self.received.lock()
            .expect("lock is poisoned")
            .push(ReceivedMessage {
                sender,
                channel_id,
                payload: payload.to_vec(),
            });
    }
}

/// An ephemeral port on localhost with short timeouts, and without broadcast
pub fn localhost_config() -> JuiceNetConfig {
    let mut config = JuiceNetConfig::new(SocketAddr::from(([127,0,0,1], 0)));
    config.broadcast = false;
    config.retry = RetryConfig {
        initial_retry_interval: Duration::from_millis(20),
        max_retry_interval: Duration::from_millis(100),
        backoff_factor_eighths: 16,
        max_retries: 5,
    };
    config.sweep_interval = Duration::from_millis(5);
    config
}
