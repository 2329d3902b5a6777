use crate::packet::container::{ContainerPacket, FragmentHeader};
use crate::reliability::ExponentialBackoff;
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5005;

pub struct JuiceNetConfig {
    pub bind_addr: SocketAddr,

    /// Sets SO_BROADCAST on the socket, which is required for sending discovery searches to a
    ///  broadcast address
    pub broadcast: bool,
    /// Whether this node answers discovery searches. Handshakes are answered regardless.
    pub discovery_allowed: bool,
    /// The address discovery searches are sent to
    pub discovery_target: SocketAddr,

    /// Requested send and receive buffer size of the OS socket, `None` leaves the OS default
    pub socket_buffer_size: Option<usize>,

    /// The maximum size of a datagram this endpoint sends, including the container header.
    ///  Bigger payloads are fragmented.
    ///
    /// NB: This is the UDP payload size. It must be supported by all network routes between
    ///      peers, since there is no MTU discovery. 1472 is full Ethernet frames with IPV4 and
    ///      no optional IP headers.
    pub max_datagram_size: usize,
    /// Payloads bigger than this are rejected on send
    pub max_message_size: usize,

    pub retry: RetryConfig,

    /// Time an ordering window waits for a missing order id before releasing what it has
    ///  buffered, `None` waits forever
    pub ordering_flush_timeout: Option<Duration>,
    pub specific_channel_flush_timeouts: FxHashMap<u8, Option<Duration>>,

    /// Time an incomplete fragment group is kept. It must exceed the sender's
    ///  [RetryConfig::retransmission_span], otherwise a late retransmission of an acknowledged
    ///  fragment can arrive after its group was discarded.
    pub reassembly_timeout: Duration,
    /// per peer
    pub max_open_reassemblies: usize,
    /// Packet counters this far above the lowest missing counter of a peer cause the missing
    ///  counters to be given up
    pub max_counter_window: u32,

    /// Peers without traffic for this long, and without pending sends, are forgotten
    pub peer_timeout: Duration,
    pub sweep_interval: Duration,

    pub event_channel_capacity: usize,

    /// Overrides the OS version reported in the local identity. Without it, the version is
    ///  detected on Linux and reported as "unknown" elsewhere.
    pub host_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// growth of the retry interval between retries, in eighths: 8 is constant, 16 is doubling
    pub backoff_factor_eighths: u32,
    /// number of retransmissions before a send is given up
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_retry_interval: Duration::from_millis(200),
            max_retry_interval: Duration::from_secs(2),
            backoff_factor_eighths: 12,
            max_retries: 8,
        }
    }
}

impl RetryConfig {
    /// The time between the first transmission of a packet and its last retransmission
    pub fn retransmission_span(&self) -> Duration {
        let mut backoff = ExponentialBackoff::new(self);
        (0..self.max_retries)
            .map(|_| backoff.next_interval())
            .sum()
    }
}

impl JuiceNetConfig {
    pub fn new(bind_addr: SocketAddr) -> JuiceNetConfig {
        JuiceNetConfig {
            bind_addr,
            broadcast: true,
            discovery_allowed: true,
            discovery_target: SocketAddr::from((Ipv4Addr::BROADCAST, bind_addr.port())),
            socket_buffer_size: None,
            max_datagram_size: 1472,
            max_message_size: 1024*1024,
            retry: RetryConfig::default(),
            ordering_flush_timeout: Some(Duration::from_secs(1)),
            specific_channel_flush_timeouts: FxHashMap::default(),
            reassembly_timeout: Duration::from_secs(15),
            max_open_reassemblies: 64,
            max_counter_window: 4096,
            peer_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(10),
            event_channel_capacity: 1024,
            host_version: None,
        }
    }

    pub fn default_ipv4() -> JuiceNetConfig {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= ContainerPacket::MAX_HEADER_LEN {
            bail!("max datagram size {} leaves no room for payload", self.max_datagram_size);
        }
        if self.max_datagram_size > u16::MAX as usize {
            bail!("max datagram size {} exceeds the payload size field", self.max_datagram_size);
        }
        if self.max_message_size > self.max_payload_per_packet() * FragmentHeader::MAX_FRAGMENTS {
            bail!("max message size {} requires more than {} fragments", self.max_message_size, FragmentHeader::MAX_FRAGMENTS);
        }
        if self.retry.backoff_factor_eighths < 8 {
            bail!("backoff factor must be at least 8 eighths, was {}", self.retry.backoff_factor_eighths);
        }
        if self.retry.initial_retry_interval.is_zero() {
            bail!("initial retry interval must be positive");
        }
        if self.retry.max_retry_interval < self.retry.initial_retry_interval {
            bail!("max retry interval is smaller than initial retry interval");
        }
        if self.reassembly_timeout <= self.retry.retransmission_span() {
            bail!("reassembly timeout {:?} does not exceed the retransmission span {:?}", self.reassembly_timeout, self.retry.retransmission_span());
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.max_open_reassemblies == 0 {
            bail!("max open reassemblies must be positive");
        }
        if self.max_counter_window == 0 {
            bail!("max counter window must be positive");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }

    /// The payload bytes that fit into a single container packet, with room for the biggest
    ///  possible header
    pub fn max_payload_per_packet(&self) -> usize {
        self.max_datagram_size - ContainerPacket::MAX_HEADER_LEN
    }

    pub fn effective_flush_timeout(&self, channel_id: u8) -> Option<Duration> {
        self.specific_channel_flush_timeouts.get(&channel_id)
            .cloned()
            .unwrap_or(self.ordering_flush_timeout)
    }
}
