use crate::error::{JuiceNetError, JuiceNetResult};
use crate::packet::WirePacket;
use crate::protocol::ID_CONTAINER_PACKET;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The delivery guarantee requested for a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReliabilityType {
    /// fire and forget: no acknowledgement, no duplicate suppression
    Unreliable = 0,
    /// acknowledged and retransmitted, delivered in arrival order
    Reliable = 1,
    /// acknowledged and retransmitted, delivered in send order per channel
    ReliableOrdered = 2,
}

/// The reliability part of a container header. Fields that are not transmitted for a given
///  reliability type do not exist in the corresponding variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityHeader {
    Unreliable,
    Reliable {
        packet_id: u32,
        packet_counter: u32,
    },
    ReliableOrdered {
        packet_id: u32,
        packet_counter: u32,
        order_id: u32,
    },
}
impl ReliabilityHeader {
    pub fn reliability_type(&self) -> ReliabilityType {
        match self {
            ReliabilityHeader::Unreliable => ReliabilityType::Unreliable,
            ReliabilityHeader::Reliable { .. } => ReliabilityType::Reliable,
            ReliabilityHeader::ReliableOrdered { .. } => ReliabilityType::ReliableOrdered,
        }
    }

    /// `(packet_id, packet_counter)` for tracked packets
    pub fn tracking(&self) -> Option<(u32, u32)> {
        match *self {
            ReliabilityHeader::Unreliable => None,
            ReliabilityHeader::Reliable { packet_id, packet_counter } => Some((packet_id, packet_counter)),
            ReliabilityHeader::ReliableOrdered { packet_id, packet_counter, .. } => Some((packet_id, packet_counter)),
        }
    }

    pub fn order_id(&self) -> Option<u32> {
        match *self {
            ReliabilityHeader::ReliableOrdered { order_id, .. } => Some(order_id),
            _ => None,
        }
    }

    fn serialized_len(&self) -> usize {
        match self {
            ReliabilityHeader::Unreliable => 1,
            ReliabilityHeader::Reliable { .. } => 1 + 8,
            ReliabilityHeader::ReliableOrdered { .. } => 1 + 12,
        }
    }
}

/// Position of a fragment inside its master payload.
///
/// On the wire, the fragment index's highest bit flags the terminal fragment of a group, which
///  is how the receiver learns the total number of fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragmentation_id: u32,
    pub index: u16,
    pub is_last: bool,
}
impl FragmentHeader {
    pub const LAST_FRAGMENT_FLAG: u16 = 0x8000;
    pub const MAX_INDEX: u16 = 0x7FFF;
    pub const MAX_FRAGMENTS: usize = Self::MAX_INDEX as usize + 1;

    fn wire_index(&self) -> u16 {
        debug_assert!(self.index <= Self::MAX_INDEX);
        if self.is_last {
            self.index | Self::LAST_FRAGMENT_FLAG
        }
        else {
            self.index
        }
    }

    fn from_wire(fragmentation_id: u32, raw_index: u16) -> FragmentHeader {
        FragmentHeader {
            fragmentation_id,
            index: raw_index & Self::MAX_INDEX,
            is_last: raw_index & Self::LAST_FRAGMENT_FLAG != 0,
        }
    }
}

/// The envelope for all application data.
///
/// ```ascii
/// 0: packet id 0x12CB (u16 LE)
/// 2: reliability type (u8): 0 unreliable, 1 reliable, 2 reliable ordered
/// *: packet id (u32 LE), packet counter (u32 LE) - not for unreliable
/// *: order id (u32 LE) - reliable ordered only
/// *: channel id (u8)
/// *: fragmented flag (u8, 0 or 1)
/// *: fragmentation id (u32 LE), fragmentation index (u16 LE, bit 15 = terminal) - fragmented only
/// *: payload size (u16 LE)
/// *: payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPacket {
    pub reliability: ReliabilityHeader,
    pub channel_id: u8,
    pub fragment: Option<FragmentHeader>,
    pub payload: Vec<u8>,
}

impl ContainerPacket {
    /// packet id + reliability type + channel id + fragmented flag + payload size
    pub const MIN_HEADER_LEN: usize = 2 + 1 + 1 + 1 + 2;
    /// header with all optional fields present
    pub const MAX_HEADER_LEN: usize = Self::MIN_HEADER_LEN + 8 + 4 + 6;

    pub fn header_len(&self) -> usize {
        let fragment_len = if self.fragment.is_some() { 6 } else { 0 };
        Self::MIN_HEADER_LEN - 1 + self.reliability.serialized_len() + fragment_len
    }
}

impl WirePacket for ContainerPacket {
    const PACKET_ID: u16 = ID_CONTAINER_PACKET;

    fn serialized_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.reliability.reliability_type().into());
        if let Some((packet_id, packet_counter)) = self.reliability.tracking() {
            buf.put_u32_le(packet_id);
            buf.put_u32_le(packet_counter);
        }
        if let Some(order_id) = self.reliability.order_id() {
            buf.put_u32_le(order_id);
        }

        buf.put_u8(self.channel_id);

        match &self.fragment {
            None => buf.put_u8(0),
            Some(fragment) => {
                buf.put_u8(1);
                buf.put_u32_le(fragment.fragmentation_id);
                buf.put_u16_le(fragment.wire_index());
            }
        }

        buf.put_u16_le(self.payload.len().prechecked_cast());
        buf.put_slice(&self.payload);
    }

    fn deser_body(buf: &mut impl Buf) -> JuiceNetResult<ContainerPacket> {
        let raw_reliability = buf.read_u8_checked()?;
        let reliability_type = ReliabilityType::try_from(raw_reliability)
            .map_err(|_| JuiceNetError::malformed(format!("invalid reliability type {}", raw_reliability)))?;

        let reliability = match reliability_type {
            ReliabilityType::Unreliable => ReliabilityHeader::Unreliable,
            ReliabilityType::Reliable => ReliabilityHeader::Reliable {
                packet_id: buf.read_u32_le_checked()?,
                packet_counter: buf.read_u32_le_checked()?,
            },
            ReliabilityType::ReliableOrdered => ReliabilityHeader::ReliableOrdered {
                packet_id: buf.read_u32_le_checked()?,
                packet_counter: buf.read_u32_le_checked()?,
                order_id: buf.read_u32_le_checked()?,
            },
        };

        let channel_id = buf.read_u8_checked()?;

        let fragment = match buf.read_u8_checked()? {
            0 => None,
            1 => {
                let fragmentation_id = buf.read_u32_le_checked()?;
                let raw_index = buf.read_u16_le_checked()?;
                Some(FragmentHeader::from_wire(fragmentation_id, raw_index))
            }
            other => return Err(JuiceNetError::malformed(format!("invalid fragmented flag {}", other))),
        };

        let payload_size = buf.read_u16_le_checked()?;
        let payload = buf.read_bytes_checked(payload_size.safe_cast())?;

        Ok(ContainerPacket {
            reliability,
            channel_id,
            fragment,
            payload,
        })
    }
}
