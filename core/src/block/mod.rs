use crate::crypto::{Hash, sha256d};
use bincode::{Decode, Encode};

/// block header
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32, // unix seconds
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Fixed 80-byte header layout.
    pub fn serialize_for_hash(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.serialize_for_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_hash: prev,
            merkle_root: Hash::ZERO,
            timestamp: 1_600_000_000,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        assert_ne!(header(Hash::ZERO, 1).hash(), header(Hash::ZERO, 2).hash());
    }

    #[test]
    fn header_layout_is_80_bytes_with_prev_at_offset_4() {
        let prev = Hash([7; 32]);
        let bytes = header(prev, 0).serialize_for_hash();
        assert_eq!(&bytes[4..36], prev.as_bytes());
    }
}
