pub mod client;
pub mod txqueue;

pub use client::{HttpLedgerClient, LedgerClient};
pub use txqueue::{TxError, TxFuture, TxOperation, TxQueue};

use sha3::{Digest, Keccak256};

/// Keccak-256 digest of arbitrary text, hex-encoded with a 0x prefix. Used
/// wherever only a commitment to off-chain text goes on-chain.
pub fn keccak_digest(text: &str) -> String {
    let hash = Keccak256::digest(text.as_bytes());
    format!("0x{}", hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_prefixed_hex() {
        let digest = keccak_digest("the faithful waver");
        assert!(digest.starts_with("0x"));
        assert_eq!(digest.len(), 2 + 64);
        assert_eq!(digest, keccak_digest("the faithful waver"));
    }
}
