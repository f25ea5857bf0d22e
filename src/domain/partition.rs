//! Partition key derivation.
//!
//! The partition key is a pure function of the event's address (and the
//! deployment-wide shard count), so every event for a given address routes
//! to the same dispatcher partition and per-address ordering survives
//! horizontal scale-out.

use sha2::{Digest, Sha256};

/// Derive the partition key for a contract address.
///
/// The digest is computed over the lowercased address. With `address_shards
/// > 1` the key is prefixed by `(first-32-bits mod shards) ":"`, which lets
/// a dispatcher worker scope itself to one shard with a prefix selector
/// such as `"0:"`.
pub fn partition_key(address: &str, address_shards: u32) -> String {
    let digest = Sha256::digest(address.to_ascii_lowercase().as_bytes());
    let hex_digest = hex::encode(digest);

    if address_shards > 1 {
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        format!("{}:{}", head % address_shards, hex_digest)
    } else {
        hex_digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_address_same_key() {
        let a = partition_key("0xAbC123", 4);
        let b = partition_key("0xabc123", 4);
        assert_eq!(a, b);
    }

    #[test]
    fn different_addresses_differ() {
        assert_ne!(partition_key("0xaa", 1), partition_key("0xbb", 1));
    }

    #[test]
    fn single_shard_has_no_prefix() {
        let key = partition_key("0xaa", 1);
        assert!(!key.contains(':'));
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn sharded_key_prefix_is_bounded() {
        for addr in ["0xaa", "0xbb", "0xcc", "0xdeadbeef"] {
            let key = partition_key(addr, 4);
            let (prefix, rest) = key.split_once(':').unwrap();
            let shard: u32 = prefix.parse().unwrap();
            assert!(shard < 4);
            assert_eq!(rest.len(), 64);
        }
    }

    #[test]
    fn shard_prefix_is_stable() {
        assert_eq!(partition_key("0xaa", 4), partition_key("0xAA", 4));
    }
}
