use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

static SYN_COOKIE_SALT: Lazy<[u8; 64]> = Lazy::new(|| {
    let mut salt = [0u8; 64];
    rand::Rng::fill(&mut rand::thread_rng(), &mut salt[..]);
    salt
});

/// Minutes since the unix epoch, the cookie's time bucket.
pub(crate) fn current_minute() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 60)
        .unwrap_or(0)
}

/// Stateless token binding a handshake reply to the peer address and a minute.
pub(crate) fn syn_cookie(peer: &SocketAddr, minute: u64) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(&SYN_COOKIE_SALT[..]);
    hasher.update(b":");
    hasher.update(peer.ip().to_string().as_bytes());
    hasher.update(b":");
    hasher.update(peer.port().to_be_bytes());
    hasher.update(b":");
    hasher.update(minute.to_be_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Accepts cookies minted during the current or the previous minute.
pub(crate) fn is_valid_cookie(peer: &SocketAddr, cookie: u32, minute: u64) -> bool {
    syn_cookie(peer, minute) == cookie || syn_cookie(peer, minute.saturating_sub(1)) == cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_survives_one_minute_edge() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let cookie = syn_cookie(&peer, 1000);
        assert!(is_valid_cookie(&peer, cookie, 1000));
        assert!(is_valid_cookie(&peer, cookie, 1001));
        assert!(!is_valid_cookie(&peer, cookie, 1002));
    }

    #[test]
    fn cookie_is_bound_to_address() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let cookie = syn_cookie(&peer, 5);
        assert!(!is_valid_cookie(&other, cookie, 5));
    }
}
