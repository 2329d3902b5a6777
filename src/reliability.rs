//! Acknowledgement bookkeeping for reliable packets: retransmission on the send side,
//!  duplicate suppression on the receive side.

use crate::config::RetryConfig;
use crate::error::{JuiceNetError, JuiceNetResult};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cmp::min;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Retry intervals growing by a configurable factor (in eighths) up to a cap
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &RetryConfig) -> ExponentialBackoff {
        assert!(config.backoff_factor_eighths >= 8);

        ExponentialBackoff {
            current: min(config.initial_retry_interval, config.max_retry_interval),
            max: config.max_retry_interval,
            factor_eighths: config.backoff_factor_eighths,
        }
    }

    /// Returns the interval to wait before the next retry, growing the interval after that
    pub fn next_interval(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.checked_mul(self.factor_eighths)
            .map(|d| min(d / 8, self.max))
            .unwrap_or(self.max);
        result
    }
}

pub struct PendingAck {
    pub packet_id: u32,
    pub datagram: Bytes,
    pub sent_at: Instant,
    pub retry_count: u32,
    pub next_retry: Instant,
    backoff: ExponentialBackoff,
    completion: Option<oneshot::Sender<JuiceNetResult<()>>>,
}

impl PendingAck {
    fn complete(&mut self, result: JuiceNetResult<()>) {
        if let Some(completion) = self.completion.take() {
            // the caller may have dropped its receipt, that is fine
            let _ = completion.send(result);
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetransmitSweep {
    /// datagrams that are due for retransmission
    pub resend: Vec<Bytes>,
    /// packet ids that exhausted their retries and were given up
    pub failed: Vec<u32>,
}

/// Send-side state for a single destination peer
pub struct SendTracker {
    peer: SocketAddr,
    next_packet_counter: u32,
    next_order_ids: FxHashMap<u8, u32>,
    pending: BTreeMap<u32, PendingAck>,
}

impl SendTracker {
    pub fn new(peer: SocketAddr) -> SendTracker {
        SendTracker {
            peer,
            next_packet_counter: 0,
            next_order_ids: FxHashMap::default(),
            pending: BTreeMap::new(),
        }
    }

    pub fn next_packet_counter(&mut self) -> u32 {
        let result = self.next_packet_counter;
        self.next_packet_counter = self.next_packet_counter.wrapping_add(1);
        result
    }

    pub fn next_order_id(&mut self, channel_id: u8) -> u32 {
        let next = self.next_order_ids.entry(channel_id).or_insert(0);
        let result = *next;
        *next = next.wrapping_add(1);
        result
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, packet_id: u32) -> bool {
        self.pending.contains_key(&packet_id)
    }

    /// Starts tracking a datagram that was just sent. The returned receiver resolves when the
    ///  packet is acknowledged, given up or cancelled.
    pub fn register(&mut self, packet_id: u32, datagram: Bytes, now: Instant, config: &RetryConfig) -> oneshot::Receiver<JuiceNetResult<()>> {
        let (completion, receiver) = oneshot::channel();
        let mut backoff = ExponentialBackoff::new(config);
        let next_retry = now + backoff.next_interval();

        let prev = self.pending.insert(packet_id, PendingAck {
            packet_id,
            datagram,
            sent_at: now,
            retry_count: 0,
            next_retry,
            backoff,
            completion: Some(completion),
        });
        debug_assert!(prev.is_none(), "packet id {} registered twice", packet_id);
        receiver
    }

    /// Returns true if the packet id was pending
    pub fn on_ack(&mut self, packet_id: u32) -> bool {
        match self.pending.remove(&packet_id) {
            Some(mut pending) => {
                trace!("packet #{} to {:?} acknowledged after {:?}", packet_id, self.peer, pending.sent_at.elapsed());
                pending.complete(Ok(()));
                true
            }
            None => {
                trace!("ack for packet #{} from {:?} which is not pending - ignoring", packet_id, self.peer);
                false
            }
        }
    }

    pub fn poll_retransmissions(&mut self, now: Instant, config: &RetryConfig) -> RetransmitSweep {
        let mut result = RetransmitSweep::default();

        for pending in self.pending.values_mut() {
            if pending.next_retry > now {
                continue;
            }

            if pending.retry_count >= config.max_retries {
                debug!("packet #{} to {:?} was not acknowledged after {} retries - giving up", pending.packet_id, self.peer, pending.retry_count);
                pending.complete(Err(JuiceNetError::DeliveryFailure {
                    peer: self.peer,
                    packet_id: pending.packet_id,
                    retries: pending.retry_count,
                }));
                result.failed.push(pending.packet_id);
                continue;
            }

            pending.retry_count += 1;
            pending.next_retry = now + pending.backoff.next_interval();
            trace!("retransmitting packet #{} to {:?} (retry {})", pending.packet_id, self.peer, pending.retry_count);
            result.resend.push(pending.datagram.clone());
        }

        for packet_id in &result.failed {
            self.pending.remove(packet_id);
        }
        result
    }

    /// Resolves all pending sends as cancelled, returning how many there were
    pub fn cancel_all(&mut self) -> usize {
        let num_cancelled = self.pending.len();
        while let Some((packet_id, mut pending)) = self.pending.pop_first() {
            pending.complete(Err(JuiceNetError::DeliveryCancelled { peer: self.peer, packet_id }));
        }
        num_cancelled
    }
}

impl Drop for SendTracker {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// The packet counters already received from one peer, for duplicate suppression.
///
/// All counters below the low-water mark were seen (or given up), counters above it are
///  stored individually. If the distance between a new counter and the low-water mark
///  exceeds the window size, the low-water mark moves up and the gaps below it are treated
///  as seen.
///
/// NB: Counters are compared without wrap-around
pub struct ReceivedCounterWindow {
    low_water_mark: u32,
    seen_above: BTreeSet<u32>,
    max_window: u32,
}

impl ReceivedCounterWindow {
    pub fn new(max_window: u32) -> ReceivedCounterWindow {
        ReceivedCounterWindow {
            low_water_mark: 0,
            seen_above: BTreeSet::new(),
            max_window,
        }
    }

    pub fn low_water_mark(&self) -> u32 {
        self.low_water_mark
    }

    /// Records a counter, returning false if it was seen before
    pub fn record(&mut self, counter: u32) -> bool {
        if counter < self.low_water_mark {
            return false;
        }
        if !self.seen_above.insert(counter) {
            return false;
        }

        if counter - self.low_water_mark > self.max_window {
            let new_low_water_mark = counter - self.max_window;
            debug!("packet counter {} is far ahead of the low-water mark {} - moving it to {}", counter, self.low_water_mark, new_low_water_mark);
            self.low_water_mark = new_low_water_mark;
            self.seen_above = self.seen_above.split_off(&new_low_water_mark);
        }

        while self.seen_above.remove(&self.low_water_mark) {
            self.low_water_mark = self.low_water_mark.wrapping_add(1);
        }
        true
    }
}

/// Returned by a send: resolves when all packets of the sent payload are acknowledged (or
///  immediately for unreliable sends).
pub struct SendReceipt {
    completions: Vec<(SocketAddr, u32, oneshot::Receiver<JuiceNetResult<()>>)>,
}

impl SendReceipt {
    pub(crate) fn untracked() -> SendReceipt {
        SendReceipt { completions: Vec::new() }
    }

    pub(crate) fn tracked(completions: Vec<(SocketAddr, u32, oneshot::Receiver<JuiceNetResult<()>>)>) -> SendReceipt {
        SendReceipt { completions }
    }

    pub fn is_tracked(&self) -> bool {
        !self.completions.is_empty()
    }

    /// the packet ids the payload was sent with, one per fragment
    pub fn packet_ids(&self) -> Vec<u32> {
        self.completions.iter().map(|(_, packet_id, _)| *packet_id).collect()
    }

    pub async fn delivered(self) -> JuiceNetResult<()> {
        for (peer, packet_id, completion) in self.completions {
            match completion.await {
                Ok(result) => result?,
                Err(_) => return Err(JuiceNetError::DeliveryCancelled { peer, packet_id }),
            }
        }
        Ok(())
    }
}
