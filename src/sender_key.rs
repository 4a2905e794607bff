use std::net::SocketAddr;

use rand::RngCore;
use siphasher::sip::SipHasher13;

use crate::table::SenderKey;

/// Derives [`SenderKey`]s from socket addresses with a keyed SipHash, so that remote peers
/// cannot choose addresses which collide in the sender map.
#[derive(Clone)]
pub struct SenderKeyHasher {
    key: [u8; 16],
}

impl Default for SenderKeyHasher {
    fn default() -> Self {
        // The thread-local RNG is a CSPRNG
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);

        Self { key }
    }
}

impl SenderKeyHasher {
    pub fn with_key(key: [u8; 16]) -> Self {
        Self { key }
    }

    pub fn compute(&self, sender_addr: &SocketAddr) -> SenderKey {
        use core::hash::Hasher;

        let mut hasher = SipHasher13::new_with_key(&self.key);

        match sender_addr {
            SocketAddr::V4(addr) => {
                hasher.write_u8(4);
                hasher.write(&addr.ip().octets());
                hasher.write_u16(addr.port());
            }
            SocketAddr::V6(addr) => {
                hasher.write_u8(6);
                hasher.write(&addr.ip().octets());
                hasher.write_u16(addr.port());
            }
        }

        hasher.finish()
    }
}
