//! Protocol-wide constants: library identification, protocol version and the packet ids
//!  that prefix every datagram.

/// The library name, used in identity tokens
pub const LIBRARY: &str = "JuiceNet-rs";
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Peers with a different major protocol version are incompatible and are never talked to.
pub const PROTOCOL_VERSION_MAJOR: u16 = 1;
/// Minor versions are compatible with each other.
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

pub const ID_SEARCH_PEERS_PACKET: u16 = 0x12AA;
pub const ID_PEER_RESPONSE_PACKET: u16 = 0x12AB;
pub const ID_CLIENT_HANDSHAKE_PACKET: u16 = 0x12BA;
pub const ID_SERVER_HANDSHAKE_PACKET: u16 = 0x12BB;
pub const ID_CONTAINER_PACKET: u16 = 0x12CB;
pub const ID_ACK_PACKET: u16 = 0x12CC;

pub fn is_compatible_major(remote_major: u16) -> bool {
    remote_major == PROTOCOL_VERSION_MAJOR
}
