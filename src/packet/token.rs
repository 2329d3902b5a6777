use crate::error::JuiceNetResult;
use crate::packet::WirePacket;
use crate::protocol::{ID_CLIENT_HANDSHAKE_PACKET, ID_PEER_RESPONSE_PACKET, ID_SEARCH_PEERS_PACKET, ID_SERVER_HANDSHAKE_PACKET};
use crate::util::buf_ext::{BufExt, BufMutExt};
use bytes::{Buf, BytesMut};

/// All discovery and handshake packets have the same layout, a single signed identity token:
///
/// ```ascii
/// 0: packet id (u16 LE)
/// 2: token length (u16 LE)
/// 4: token (UTF-8)
/// ```
macro_rules! token_packet {
    ($(#[$doc:meta])* $name: ident, $packet_id: expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub token: String,
        }

        impl $name {
            pub fn new(token: impl Into<String>) -> $name {
                $name { token: token.into() }
            }
        }

        impl WirePacket for $name {
            const PACKET_ID: u16 = $packet_id;

            fn serialized_len(&self) -> usize {
                2 + 2 + self.token.len()
            }

            fn ser_body(&self, buf: &mut BytesMut) {
                buf.put_string_le(&self.token);
            }

            fn deser_body(buf: &mut impl Buf) -> JuiceNetResult<$name> {
                Ok($name { token: buf.read_string_checked()? })
            }
        }
    }
}

token_packet!(
    /// Broadcast by a node looking for peers. Peers that allow discovery answer with a
    ///  [PeerResponsePacket].
    SearchPeersPacket, ID_SEARCH_PEERS_PACKET
);
token_packet!(
    /// Unicast answer to a [SearchPeersPacket], carrying the responder's identity
    PeerResponsePacket, ID_PEER_RESPONSE_PACKET
);
token_packet!(ClientHandshakePacket, ID_CLIENT_HANDSHAKE_PACKET);
token_packet!(ServerHandshakePacket, ID_SERVER_HANDSHAKE_PACKET);
