use crate::packet::UDT_HEADER_SIZE;
use crate::seq_number::{MsgNumber, SeqNumber};
use crate::socket::SocketId;
use bytes::{Buf, BufMut, Bytes};
use tokio::io::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UdtDataPacket {
    pub header: UdtDataPacketHeader,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UdtDataPacketHeader {
    // bit 0 = 0
    pub seq_number: SeqNumber,    // bits 1-31
    pub position: PacketPosition, // bits 32-33
    pub in_order: bool,           // bit 34
    pub msg_number: MsgNumber,    // bits 35-63
    pub timestamp: u32,           // bits 64-95
    pub dest_socket_id: SocketId, // bits 96-127
}

impl UdtDataPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let header = &self.header;
        let mut buffer = Vec::with_capacity(UDT_HEADER_SIZE + self.data.len());
        buffer.put_u32(header.seq_number.number());
        buffer.put_u32(
            (header.position as u32) << 30
                | (header.in_order as u32) << 29
                | header.msg_number.number(),
        );
        buffer.put_u32(header.timestamp);
        buffer.put_u32(header.dest_socket_id);
        buffer.extend_from_slice(&self.data);
        buffer
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < UDT_HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "data packet header too short",
            ));
        }
        let seq_number = (raw.get_u32() & 0x7fff_ffff).into();
        let second = raw.get_u32();
        let position = PacketPosition::from((second >> 30) as u8);
        let header = UdtDataPacketHeader {
            seq_number,
            position,
            in_order: (second >> 29) & 1 == 1,
            msg_number: (second & MsgNumber::MAX_NUMBER).into(),
            timestamp: raw.get_u32(),
            dest_socket_id: raw.get_u32(),
        };
        Ok(Self {
            header,
            data: Bytes::copy_from_slice(raw),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketPosition {
    Middle = 0b00,
    Last = 0b01,
    First = 0b10,
    Only = 0b11,
}

impl PacketPosition {
    pub fn new(index: usize, count: usize) -> Self {
        match (index == 0, index + 1 == count) {
            (true, true) => Self::Only,
            (true, false) => Self::First,
            (false, true) => Self::Last,
            (false, false) => Self::Middle,
        }
    }
}

impl From<u8> for PacketPosition {
    fn from(raw_position: u8) -> Self {
        match raw_position & 0b11 {
            0b10 => PacketPosition::First,
            0b01 => PacketPosition::Last,
            0b11 => PacketPosition::Only,
            _ => PacketPosition::Middle,
        }
    }
}
