use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Releases reliable-ordered payloads of one (peer, channel) pair in order-id sequence.
///
/// Payloads that arrive ahead of a gap are buffered until the gap is filled. If a flush
///  timeout is configured, and the oldest buffered payload has waited longer than that, the
///  gap is given up: everything buffered is released in ascending order and the missing
///  payloads are treated as lost. Without a flush timeout, the window waits forever.
///
/// NB: Order ids are compared without wrap-around - a sender would have to send 2^32 ordered
///      payloads on a channel for this to matter
pub struct OrderingWindow {
    flush_timeout: Option<Duration>,
    next_expected: u32,
    buffered: BTreeMap<u32, (Instant, Vec<u8>)>,
}

impl OrderingWindow {
    pub fn new(flush_timeout: Option<Duration>) -> OrderingWindow {
        OrderingWindow {
            flush_timeout,
            next_expected: 0,
            buffered: BTreeMap::new(),
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Returns the payloads that can be released to the application, in order
    pub fn on_packet(&mut self, order_id: u32, payload: Vec<u8>, now: Instant) -> Vec<Vec<u8>> {
        if order_id < self.next_expected {
            debug!("order id {} is below the next expected id {} - dropping stale duplicate", order_id, self.next_expected);
            return Vec::new();
        }

        if order_id > self.next_expected {
            trace!("order id {} arrived ahead of {} - buffering", order_id, self.next_expected);
            self.buffered.entry(order_id)
                .or_insert((now, payload));
            return Vec::new();
        }

        let mut result = vec![payload];
        self.next_expected = self.next_expected.wrapping_add(1);
        self.drain_contiguous(&mut result);
        result
    }

    /// Force-releases all buffered payloads if the oldest of them has waited past the flush
    ///  timeout
    pub fn flush_expired(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let Some(flush_timeout) = self.flush_timeout else {
            return Vec::new();
        };

        let oldest_arrival = match self.buffered.values().map(|(arrival, _)| *arrival).min() {
            Some(arrival) => arrival,
            None => return Vec::new(),
        };
        if now.saturating_duration_since(oldest_arrival) <= flush_timeout {
            return Vec::new();
        }

        debug!("ordering window waited longer than {:?} for order id {} - releasing {} buffered payloads", flush_timeout, self.next_expected, self.buffered.len());

        let mut result = Vec::with_capacity(self.buffered.len());
        while let Some((order_id, (_, payload))) = self.buffered.pop_first() {
            result.push(payload);
            self.next_expected = order_id.wrapping_add(1);
        }
        result
    }

    fn drain_contiguous(&mut self, result: &mut Vec<Vec<u8>>) {
        while let Some((_, payload)) = self.buffered.remove(&self.next_expected) {
            result.push(payload);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }
}
