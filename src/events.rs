use crate::identity::PeerIdentity;
use std::net::SocketAddr;

/// Things that happen inside an endpoint without being the result of an API call. They are
///  published on a broadcast channel, see [crate::end_point::EndPoint::subscribe_events].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Started {
        local_addr: SocketAddr,
    },
    Stopped,
    MalformedPacket {
        from: SocketAddr,
        reason: String,
    },
    ProtocolVersionMismatch {
        from: SocketAddr,
        remote_major: u16,
    },
    DeliveryFailed {
        peer: SocketAddr,
        packet_id: u32,
    },
    ReassemblyTimedOut {
        peer: SocketAddr,
        fragmentation_id: u32,
    },
    /// a peer completed a handshake with this node
    PeerConnected {
        addr: SocketAddr,
        identity: PeerIdentity,
    },
    /// a handshake revealed a new peer id at a known address, i.e. the peer was restarted.
    ///  The state exchanged with its previous incarnation was discarded.
    PeerRestarted {
        addr: SocketAddr,
        previous_peer_id: u64,
        peer_id: u64,
    },
    PeerEvicted {
        addr: SocketAddr,
    },
}
