//! The wire codec: every datagram starts with a 2-byte little-endian packet id, followed by
//!  a packet-specific body.

pub mod ack;
pub mod container;
pub mod token;

use crate::error::{JuiceNetError, JuiceNetResult};
use crate::protocol::*;
use crate::util::buf_ext::BufExt;
use ack::AckPacket;
use bytes::{Buf, BufMut, BytesMut};
use container::ContainerPacket;
use token::{ClientHandshakePacket, PeerResponsePacket, SearchPeersPacket, ServerHandshakePacket};

/// Encoding / decoding contract shared by all packet kinds.
pub trait WirePacket: Sized {
    const PACKET_ID: u16;

    /// total length on the wire, including the packet id prefix
    fn serialized_len(&self) -> usize;

    fn ser_body(&self, buf: &mut BytesMut);

    fn deser_body(buf: &mut impl Buf) -> JuiceNetResult<Self>;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(Self::PACKET_ID);
        self.ser_body(buf);
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf
    }

    /// Decodes a packet of exactly this kind, failing if the datagram carries a different
    ///  packet id
    fn decode(mut buf: &[u8]) -> JuiceNetResult<Self> {
        let packet_id = buf.read_u16_le_checked()?;
        if packet_id != Self::PACKET_ID {
            return Err(JuiceNetError::malformed(format!(
                "expected packet id {:#06x}, found {:#06x}", Self::PACKET_ID, packet_id
            )));
        }
        Self::deser_body(&mut buf)
    }
}

/// All packet kinds of the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JuiceNetPacket {
    SearchPeers(SearchPeersPacket),
    PeerResponse(PeerResponsePacket),
    ClientHandshake(ClientHandshakePacket),
    ServerHandshake(ServerHandshakePacket),
    Container(ContainerPacket),
    Ack(AckPacket),
}

impl JuiceNetPacket {
    pub fn peek_packet_id(mut buf: &[u8]) -> JuiceNetResult<u16> {
        buf.read_u16_le_checked()
    }

    /// Returns `Ok(None)` for packet ids this implementation does not know
    pub fn decode(buf: &[u8]) -> JuiceNetResult<Option<JuiceNetPacket>> {
        let packet = match Self::peek_packet_id(buf)? {
            ID_SEARCH_PEERS_PACKET => JuiceNetPacket::SearchPeers(SearchPeersPacket::decode(buf)?),
            ID_PEER_RESPONSE_PACKET => JuiceNetPacket::PeerResponse(PeerResponsePacket::decode(buf)?),
            ID_CLIENT_HANDSHAKE_PACKET => JuiceNetPacket::ClientHandshake(ClientHandshakePacket::decode(buf)?),
            ID_SERVER_HANDSHAKE_PACKET => JuiceNetPacket::ServerHandshake(ServerHandshakePacket::decode(buf)?),
            ID_CONTAINER_PACKET => JuiceNetPacket::Container(ContainerPacket::decode(buf)?),
            ID_ACK_PACKET => JuiceNetPacket::Ack(AckPacket::decode(buf)?),
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }

    pub fn encode(&self) -> BytesMut {
        match self {
            JuiceNetPacket::SearchPeers(p) => p.encode(),
            JuiceNetPacket::PeerResponse(p) => p.encode(),
            JuiceNetPacket::ClientHandshake(p) => p.encode(),
            JuiceNetPacket::ServerHandshake(p) => p.encode(),
            JuiceNetPacket::Container(p) => p.encode(),
            JuiceNetPacket::Ack(p) => p.encode(),
        }
    }
}
