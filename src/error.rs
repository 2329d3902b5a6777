use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the JuiceNet protocol layer.
///
/// Most of these never reach application code as a `Result`: malformed datagrams, version
///  mismatches and reassembly timeouts are dropped by the receive loop and published as
///  [crate::events::TransportEvent]s instead.
#[derive(Debug, Error)]
pub enum JuiceNetError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("incompatible protocol version: local major {local_major}, remote major {remote_major}")]
    ProtocolVersionMismatch { local_major: u16, remote_major: u16 },

    #[error("failed to bind UDP socket to {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("packet #{packet_id} to {peer} was not acknowledged after {retries} retries")]
    DeliveryFailure { peer: SocketAddr, packet_id: u32, retries: u32 },

    #[error("send of packet #{packet_id} to {peer} was cancelled by endpoint shutdown")]
    DeliveryCancelled { peer: SocketAddr, packet_id: u32 },

    #[error("fragment group {fragmentation_id} from {peer} was not completed in time")]
    ReassemblyTimeout { peer: SocketAddr, fragmentation_id: u32 },

    #[error("invalid identity token: {0}")]
    InvalidToken(String),

    #[error("no handshake response from {0}")]
    HandshakeTimeout(SocketAddr),

    #[error("endpoint is not running")]
    NotRunning,

    #[error("endpoint cannot {0} in its current state")]
    InvalidState(&'static str),

    #[error("payload of {len} bytes exceeds the maximum message size of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

impl JuiceNetError {
    pub(crate) fn malformed(msg: impl Into<String>) -> JuiceNetError {
        JuiceNetError::MalformedPacket(msg.into())
    }
}

pub type JuiceNetResult<T> = Result<T, JuiceNetError>;
