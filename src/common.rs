use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{Error, ErrorKind, Result};

/// Packs an IPv4 address into the 32-bit big-endian handshake field.
pub fn ip_to_u32(ip: IpAddr) -> Result<u32> {
    match ip {
        IpAddr::V4(addr) => Ok(u32::from_be_bytes(addr.octets())),
        IpAddr::V6(_) => Err(Error::new(
            ErrorKind::Unsupported,
            "only IPv4 addresses are supported",
        )),
    }
}

pub fn u32_to_ip(raw: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(raw.to_be_bytes()))
}

pub fn ensure_ipv4(addr: &SocketAddr) -> Result<()> {
    ip_to_u32(addr.ip()).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_dotted_quad_big_endian() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(ip_to_u32(ip).unwrap(), 0x0a00_0001);
        assert_eq!(u32_to_ip(0x0a00_0001), ip);
    }

    #[test]
    fn rejects_ipv6() {
        let ip: IpAddr = "::1".parse().unwrap();
        assert_eq!(ip_to_u32(ip).unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
