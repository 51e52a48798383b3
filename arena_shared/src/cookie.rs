//! Stateless pre-auth cookie handshake.
//!
//! Before any application traffic is accepted from an unverified source
//! address, a client walks HELLO → CHALLENGE → AUTH. The challenge cookie
//! is derived from a server secret, the remote address, the client nonce,
//! and a coarse time bucket, so the server keeps no per-address state
//! until the cookie verifies. Buckets one step either side of "now" are
//! accepted to tolerate clock drift.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Width of one cookie time bucket in seconds.
pub const BUCKET_SECS: u64 = 30;

/// Truncated MAC length.
pub const COOKIE_LEN: usize = 16;

/// Mints and verifies handshake cookies with a fixed secret.
#[derive(Clone)]
pub struct CookieMinter {
    secret: Vec<u8>,
}

impl CookieMinter {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// The current coarse time bucket (unix seconds / `BUCKET_SECS`).
    pub fn current_bucket() -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        (secs / BUCKET_SECS) as u32
    }

    /// `truncate16(HMAC-SHA256(secret, addr || nonce || bucket))`.
    pub fn mint(&self, addr: SocketAddr, nonce: u64, bucket: u32) -> [u8; COOKIE_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(addr.to_string().as_bytes());
        mac.update(&nonce.to_le_bytes());
        mac.update(&bucket.to_le_bytes());
        let digest = mac.finalize().into_bytes();
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&digest[..COOKIE_LEN]);
        cookie
    }

    /// Accepts the cookie when the echoed bucket is within one step of the
    /// current bucket and the MAC matches for that bucket.
    pub fn verify(
        &self,
        addr: SocketAddr,
        nonce: u64,
        bucket: u32,
        cookie: &[u8; COOKIE_LEN],
    ) -> bool {
        let now = Self::current_bucket();
        if bucket.abs_diff(now) > 1 {
            return false;
        }
        // Constant-time compare via the hmac verifier.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(addr.to_string().as_bytes());
        mac.update(&nonce.to_le_bytes());
        mac.update(&bucket.to_le_bytes());
        mac.verify_truncated_left(cookie).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[test]
    fn minted_cookie_verifies() {
        let minter = CookieMinter::new("secret");
        let bucket = CookieMinter::current_bucket();
        let cookie = minter.mint(addr(), 0xCAFE, bucket);
        assert!(minter.verify(addr(), 0xCAFE, bucket, &cookie));
    }

    #[test]
    fn neighbor_buckets_are_accepted() {
        let minter = CookieMinter::new("secret");
        let bucket = CookieMinter::current_bucket();
        for b in [bucket - 1, bucket, bucket + 1] {
            let cookie = minter.mint(addr(), 1, b);
            assert!(minter.verify(addr(), 1, b, &cookie), "bucket {b}");
        }
        let stale = bucket - 2;
        let cookie = minter.mint(addr(), 1, stale);
        assert!(!minter.verify(addr(), 1, stale, &cookie));
    }

    #[test]
    fn cookie_binds_address_and_nonce() {
        let minter = CookieMinter::new("secret");
        let bucket = CookieMinter::current_bucket();
        let cookie = minter.mint(addr(), 0xCAFE, bucket);

        let other: SocketAddr = "127.0.0.1:6666".parse().unwrap();
        assert!(!minter.verify(other, 0xCAFE, bucket, &cookie));
        assert!(!minter.verify(addr(), 0xBEEF, bucket, &cookie));
    }

    #[test]
    fn forged_cookie_is_rejected() {
        let minter = CookieMinter::new("secret");
        let bucket = CookieMinter::current_bucket();
        let mut cookie = minter.mint(addr(), 7, bucket);
        cookie[0] ^= 0xFF;
        assert!(!minter.verify(addr(), 7, bucket, &cookie));
    }
}
