use crate::common::{ip_to_u32, u32_to_ip};
use crate::packet::UDT_HEADER_SIZE;
use crate::seq_number::{AckSeqNumber, SeqNumber};
use crate::socket::{SocketId, SocketType};
use bytes::{Buf, BufMut};
use std::net::IpAddr;
use tokio::io::{Error, ErrorKind, Result};

pub(crate) const HANDSHAKE_INFO_SIZE: usize = 36;
pub(crate) const LIGHT_ACK_SIZE: usize = UDT_HEADER_SIZE + 4;
pub(crate) const FULL_ACK_SIZE: usize = UDT_HEADER_SIZE + 24;

const LOSS_RANGE_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UdtControlPacket {
    // bit 0 = 1
    pub packet_type: ControlPacketType, // bits 1-15 + Control Information Field (bits 128+)
    pub reserved: u16,                  // bits 16-31
    pub additional_info: u32,           // bits 32-63
    pub timestamp: u32,                 // bits 64-95
    pub dest_socket_id: SocketId,       // bits 96-127
}

impl UdtControlPacket {
    pub fn new(packet_type: ControlPacketType, dest_socket_id: SocketId) -> Self {
        Self {
            packet_type,
            reserved: 0,
            additional_info: 0,
            timestamp: 0,
            dest_socket_id,
        }
    }

    pub fn new_handshake(hs: HandShakeInfo, dest_socket_id: SocketId) -> Self {
        Self::new(ControlPacketType::Handshake(hs), dest_socket_id)
    }

    pub fn new_ack(ack_number: AckSeqNumber, info: AckInfo, dest_socket_id: SocketId) -> Self {
        Self {
            additional_info: ack_number.number(),
            ..Self::new(ControlPacketType::Ack(info), dest_socket_id)
        }
    }

    pub fn new_ack2(ack_number: u32, dest_socket_id: SocketId) -> Self {
        Self {
            additional_info: ack_number,
            ..Self::new(ControlPacketType::Ack2, dest_socket_id)
        }
    }

    pub fn new_nak(loss_list: Vec<u32>, dest_socket_id: SocketId) -> Self {
        Self::new(
            ControlPacketType::Nak(NakInfo {
                loss_info: loss_list,
            }),
            dest_socket_id,
        )
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer: Vec<u8> = Vec::with_capacity(UDT_HEADER_SIZE + HANDSHAKE_INFO_SIZE);
        buffer.put_u16(0x8000 | self.packet_type.type_as_u15());
        buffer.put_u16(self.reserved);
        buffer.put_u32(self.additional_info);
        buffer.put_u32(self.timestamp);
        buffer.put_u32(self.dest_socket_id);
        self.packet_type.write_control_info(&mut buffer);
        buffer
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < UDT_HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "control packet header too short",
            ));
        }
        let total_len = raw.len();
        let type_code = raw.get_u16() & 0x7fff;
        let reserved = raw.get_u16();
        let additional_info = raw.get_u32();
        let timestamp = raw.get_u32();
        let dest_socket_id = raw.get_u32();
        let packet_type = ControlPacketType::deserialize(type_code, total_len, raw)?;
        Ok(Self {
            packet_type,
            reserved,
            additional_info,
            timestamp,
            dest_socket_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ControlPacketType {
    Handshake(HandShakeInfo),
    KeepAlive,
    Ack(AckInfo),
    Nak(NakInfo),
    Shutdown,
    Ack2,
    Unknown(u16),
}

impl ControlPacketType {
    pub fn type_as_u15(&self) -> u16 {
        match self {
            Self::Handshake(_) => 0x0000,
            Self::KeepAlive => 0x0001,
            Self::Ack(_) => 0x0002,
            Self::Nak(_) => 0x0003,
            Self::Shutdown => 0x0005,
            Self::Ack2 => 0x0006,
            Self::Unknown(code) => *code & 0x7fff,
        }
    }

    fn write_control_info(&self, buffer: &mut Vec<u8>) {
        match self {
            Self::Handshake(hs) => hs.serialize(buffer),
            Self::Ack(ack) => ack.serialize(buffer),
            Self::Nak(nak) => nak.loss_info.iter().for_each(|v| buffer.put_u32(*v)),
            _ => {}
        }
    }

    fn deserialize(type_code: u16, total_len: usize, raw: &[u8]) -> Result<Self> {
        let packet_type = match type_code {
            0x0000 => Self::Handshake(HandShakeInfo::deserialize(raw)?),
            0x0001 => Self::KeepAlive,
            0x0002 => Self::Ack(AckInfo::deserialize(total_len, raw)?),
            0x0003 => Self::Nak(NakInfo::deserialize(raw)),
            0x0005 => Self::Shutdown,
            0x0006 => Self::Ack2,
            code => Self::Unknown(code),
        };
        Ok(packet_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HandShakeInfo {
    pub udt_version: u32,
    pub socket_type: SocketType,
    pub initial_seq_number: SeqNumber,
    pub max_packet_size: u32,
    pub max_window_size: u32,
    pub connection_type: i32, // 1 when initiating, -1 when responding
    pub socket_id: SocketId,
    pub syn_cookie: u32,
    pub ip_address: IpAddr,
}

impl HandShakeInfo {
    fn serialize(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32(self.udt_version);
        buffer.put_u32(self.socket_type as u32);
        buffer.put_u32(self.initial_seq_number.number());
        buffer.put_u32(self.max_packet_size);
        buffer.put_u32(self.max_window_size);
        buffer.put_i32(self.connection_type);
        buffer.put_u32(self.socket_id);
        buffer.put_u32(self.syn_cookie);
        // IPv6 never reaches the wire: endpoints refuse to bind or connect to it.
        buffer.put_u32(ip_to_u32(self.ip_address).unwrap_or(0));
    }

    fn deserialize(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < HANDSHAKE_INFO_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake payload too short",
            ));
        }
        Ok(Self {
            udt_version: raw.get_u32(),
            socket_type: SocketType::try_from(raw.get_u32())?,
            initial_seq_number: raw.get_u32().into(),
            max_packet_size: raw.get_u32(),
            max_window_size: raw.get_u32(),
            connection_type: raw.get_i32(),
            socket_id: raw.get_u32(),
            syn_cookie: raw.get_u32(),
            ip_address: u32_to_ip(raw.get_u32()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AckInfo {
    /// The packet sequence number to which all the
    /// previous packets have been received (excluding)
    pub next_seq_number: SeqNumber,
    pub info: Option<AckOptionalInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AckOptionalInfo {
    /// RTT in microseconds
    pub rtt: u32,
    pub rtt_variance: u32,
    pub available_buf_size: u32,
    pub pack_recv_rate: u32,
    pub link_capacity: u32,
}

impl AckInfo {
    fn serialize(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32(self.next_seq_number.number());
        if let Some(info) = &self.info {
            buffer.put_u32(info.rtt);
            buffer.put_u32(info.rtt_variance);
            buffer.put_u32(info.available_buf_size);
            buffer.put_u32(info.pack_recv_rate);
            buffer.put_u32(info.link_capacity);
        }
    }

    // Full and light acks only differ by the datagram length.
    fn deserialize(total_len: usize, mut raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::new(ErrorKind::InvalidData, "ack payload too short"));
        }
        let next_seq_number = raw.get_u32().into();
        let info = if total_len == FULL_ACK_SIZE {
            Some(AckOptionalInfo {
                rtt: raw.get_u32(),
                rtt_variance: raw.get_u32(),
                available_buf_size: raw.get_u32(),
                pack_recv_rate: raw.get_u32(),
                link_capacity: raw.get_u32(),
            })
        } else {
            None
        };
        Ok(Self {
            next_seq_number,
            info,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NakInfo {
    pub loss_info: Vec<u32>,
}

impl NakInfo {
    fn deserialize(mut raw: &[u8]) -> Self {
        let mut loss_info = Vec::with_capacity(raw.len() / 4);
        while raw.remaining() >= 4 {
            loss_info.push(raw.get_u32());
        }
        Self { loss_info }
    }

    /// Expands compressed entries: a value with the high bit set opens an
    /// inclusive range closed by the next value.
    pub fn lost_sequences(&self) -> Vec<(SeqNumber, SeqNumber)> {
        let mut ranges = vec![];
        let mut iter = self.loss_info.iter();
        while let Some(value) = iter.next() {
            if value & LOSS_RANGE_FLAG != 0 {
                let start: SeqNumber = (value & !LOSS_RANGE_FLAG).into();
                match iter.next() {
                    Some(end) => ranges.push((start, (*end).into())),
                    None => ranges.push((start, start)),
                }
            } else {
                let seq: SeqNumber = (*value).into();
                ranges.push((seq, seq));
            }
        }
        ranges
    }

    pub fn encode_range(start: SeqNumber, end: SeqNumber) -> Vec<u32> {
        if start == end {
            vec![start.number()]
        } else {
            vec![start.number() | LOSS_RANGE_FLAG, end.number()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> HandShakeInfo {
        HandShakeInfo {
            udt_version: 4,
            socket_type: SocketType::Stream,
            initial_seq_number: 12345.into(),
            max_packet_size: 1500,
            max_window_size: 8192,
            connection_type: -1,
            socket_id: 0xdead_beef,
            syn_cookie: 42,
            ip_address: "127.0.0.1".parse().unwrap(),
        }
    }

    #[test]
    fn handshake_layout() {
        let packet = UdtControlPacket::new_handshake(handshake(), 7);
        let raw = packet.serialize();
        assert_eq!(raw.len(), UDT_HEADER_SIZE + HANDSHAKE_INFO_SIZE);
        assert_eq!(&raw[0..2], &[0x80, 0x00]);
        assert_eq!(&raw[12..16], &7u32.to_be_bytes());
        // connection type is a signed word
        assert_eq!(&raw[36..40], &(-1i32).to_be_bytes());
        assert_eq!(&raw[48..52], &[127, 0, 0, 1]);
        assert_eq!(UdtControlPacket::deserialize(&raw).unwrap(), packet);
    }

    #[test]
    fn ack_kind_is_decided_by_length() {
        let light = UdtControlPacket::new_ack(
            3.into(),
            AckInfo {
                next_seq_number: 100.into(),
                info: None,
            },
            9,
        );
        let raw = light.serialize();
        assert_eq!(raw.len(), LIGHT_ACK_SIZE);

        let full = UdtControlPacket::new_ack(
            4.into(),
            AckInfo {
                next_seq_number: 100.into(),
                info: Some(AckOptionalInfo {
                    rtt: 1000,
                    rtt_variance: 10,
                    available_buf_size: 64,
                    pack_recv_rate: 0,
                    link_capacity: 0,
                }),
            },
            9,
        );
        let raw = full.serialize();
        assert_eq!(raw.len(), 40);
        let decoded = UdtControlPacket::deserialize(&raw).unwrap();
        assert_eq!(decoded.additional_info, 4);
        match decoded.packet_type {
            ControlPacketType::Ack(info) => assert_eq!(info.info.unwrap().rtt, 1000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn nak_ranges_expand() {
        let mut loss_info = NakInfo::encode_range(5.into(), 5.into());
        loss_info.extend(NakInfo::encode_range(10.into(), 12.into()));
        let nak = NakInfo { loss_info };
        assert_eq!(
            nak.lost_sequences(),
            vec![(5.into(), 5.into()), (10.into(), 12.into())]
        );
    }

    #[test]
    fn unknown_type_is_preserved() {
        let raw = UdtControlPacket::new(ControlPacketType::Unknown(0x7fff), 1).serialize();
        let decoded = UdtControlPacket::deserialize(&raw).unwrap();
        assert_eq!(decoded.packet_type, ControlPacketType::Unknown(0x7fff));
    }
}
