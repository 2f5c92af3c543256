use super::control_packet::UdtControlPacket;
use super::data_packet::UdtDataPacket;
use crate::socket::SocketId;
use tokio::io::{Error, ErrorKind, Result};

pub const UDT_HEADER_SIZE: usize = 16;

/// Per-datagram overhead removed from the negotiated packet size to get the
/// payload size of a data fragment.
pub const DATA_PACKET_OVERHEAD: u32 = 2 * UDT_HEADER_SIZE as u32;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UdtPacket {
    Control(UdtControlPacket),
    Data(UdtDataPacket),
}

impl UdtPacket {
    /// Socket the datagram is addressed to, 0 for connection requests.
    pub fn dest_socket_id(&self) -> SocketId {
        match self {
            Self::Control(ctrl) => ctrl.dest_socket_id,
            Self::Data(data) => data.header.dest_socket_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Control(p) => p.serialize(),
            Self::Data(p) => p.serialize(),
        }
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "cannot deserialize empty packet",
            ));
        }
        if raw[0] & 0x80 == 0 {
            UdtDataPacket::deserialize(raw).map(Self::Data)
        } else {
            UdtControlPacket::deserialize(raw).map(Self::Control)
        }
    }
}

impl From<UdtControlPacket> for UdtPacket {
    fn from(ctrl: UdtControlPacket) -> Self {
        Self::Control(ctrl)
    }
}

impl From<UdtDataPacket> for UdtPacket {
    fn from(data_packet: UdtDataPacket) -> Self {
        Self::Data(data_packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_packet::ControlPacketType;

    #[test]
    fn rejects_empty_and_truncated_datagrams() {
        assert_eq!(
            UdtPacket::deserialize(&[]).unwrap_err().kind(),
            ErrorKind::InvalidData
        );
        assert!(UdtPacket::deserialize(&[0x80, 0, 0, 2]).is_err());
        assert!(UdtPacket::deserialize(&[0x00; 8]).is_err());
    }

    #[test]
    fn first_bit_selects_packet_kind() {
        let shutdown = UdtControlPacket::new(ControlPacketType::Shutdown, 77);
        let decoded = UdtPacket::deserialize(&shutdown.serialize()).unwrap();
        match decoded {
            UdtPacket::Control(ref ctrl) => assert_eq!(ctrl.dest_socket_id, 77),
            ref other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decoded.dest_socket_id(), 77);
    }
}
