//! JuiceNet is a lightweight transport protocol on top of UDP for peer-to-peer applications. It
//!  offers a choice of delivery guarantees per payload, transparent fragmentation of payloads
//!  that do not fit into a datagram, and a discovery mechanism for finding peers on the local
//!  network.
//!
//! ## Delivery guarantees
//!
//! * *unreliable*: a payload is sent once. It may get lost or arrive twice, and payloads may
//!    arrive in a different order than they were sent.
//! * *reliable*: the receiver acknowledges every packet, and the sender retransmits packets
//!    until they are acknowledged or a maximum number of retries is reached. The receiver
//!    suppresses duplicates, but payloads are delivered in the order they arrive.
//! * *reliable ordered*: like *reliable*, and in addition the receiver delivers payloads of a
//!    given channel in the order they were sent. A gap caused by a packet that does not arrive
//!    holds back later payloads until it is filled or a configurable flush timeout expires.
//!
//! There is no connection setup: peers are identified by their socket address, and all
//!  per-peer state is created on the fly and discarded after a period of inactivity.
//!
//! ## Channels
//!
//! Every payload is sent on a channel (0-255), and the receiving application registers handlers
//!  per channel. Ordering guarantees apply per channel, so unrelated traffic on different
//!  channels does not block each other.
//!
//! ## Wire format
//!
//! All numbers are little endian. Every datagram starts with a packet id (u16):
//!
//! ```ascii
//! 0x12AA  search peers      - identity token (u16 length + UTF-8)
//! 0x12AB  peer response     - identity token
//! 0x12BA  client handshake  - identity token
//! 0x12BB  server handshake  - identity token
//! 0x12CB  container         - application payload, see below
//! 0x12CC  ack               - number of ids (u16), acknowledged packet ids (u32 each)
//! ```
//!
//! Container packets carry application data:
//!
//! ```ascii
//! 0: packet id 0x12CB (u16)
//! 2: reliability type (u8): 0 unreliable, 1 reliable, 2 reliable ordered
//! *: packet id (u32), packet counter (u32) - not present for unreliable packets
//! *: order id (u32) - reliable ordered only
//! *: channel id (u8)
//! *: fragmented flag (u8): 0 or 1
//! *: fragmentation id (u32), fragment index (u16) - fragmented only. Bit 15 of the index
//!     flags the last fragment of a payload
//! *: payload size (u16)
//! *: payload
//! ```
//!
//! The packet id is unique per sending endpoint and is what an ack refers to. The packet counter
//!  is counted per destination and is used by the receiver to detect duplicates. The order id is
//!  counted per destination and channel; all fragments of a payload share the payload's order id.
//!
//! An unreliable, unfragmented container has 7 bytes of overhead, a fully featured one 25 bytes.
//!
//! ## Identity tokens
//!
//! Discovery and handshake packets carry a signed token with the sender's identity: library
//!  name and version, protocol version, a random peer id, the port and some system information.
//!  Peers with a different major protocol version are ignored.

pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod end_point;
pub mod error;
pub mod events;
pub mod identity;
pub mod ordering;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod reassembly;
pub mod reliability;
pub mod send_socket;
pub mod test_util;
pub mod util;
