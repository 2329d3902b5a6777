use crate::error::{JuiceNetError, JuiceNetResult};
use crate::packet::WirePacket;
use crate::protocol::ID_ACK_PACKET;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;
use bytes::{Buf, BufMut, BytesMut};

/// Acknowledges reliable container packets by their packet id.
///
/// ```ascii
/// 0: packet id 0x12CC (u16 LE)
/// 2: number of acknowledged ids (u16 LE)
/// *: (repeated) acknowledged packet id (u32 LE)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub packet_ids: Vec<u32>,
}

impl AckPacket {
    pub const MAX_IDS: usize = u16::MAX as usize;

    pub fn single(packet_id: u32) -> AckPacket {
        AckPacket { packet_ids: vec![packet_id] }
    }
}

impl WirePacket for AckPacket {
    const PACKET_ID: u16 = ID_ACK_PACKET;

    fn serialized_len(&self) -> usize {
        2 + 2 + 4 * self.packet_ids.len()
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        debug_assert!(self.packet_ids.len() <= Self::MAX_IDS);
        buf.put_u16_le(self.packet_ids.len().prechecked_cast());
        for &packet_id in &self.packet_ids {
            buf.put_u32_le(packet_id);
        }
    }

    fn deser_body(buf: &mut impl Buf) -> JuiceNetResult<AckPacket> {
        let num_ids = buf.read_u16_le_checked()? as usize;
        if buf.remaining() < 4 * num_ids {
            return Err(JuiceNetError::malformed(format!("ack declares {} ids but has only {} bytes left", num_ids, buf.remaining())));
        }

        let mut packet_ids = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            packet_ids.push(buf.read_u32_le_checked()?);
        }
        Ok(AckPacket { packet_ids })
    }
}
