//! Collaborator stores used by the node.
//!
//! Durable implementations belong to the embedding application; the
//! in-memory versions here are what the binary and the tests run against.

use log::debug;
use parking_lot::RwLock;
use spynode_core::crypto::Hash;
use std::collections::{HashMap, HashSet};

/// Peer reputation store.
pub trait PeerRepository: Send + Sync {
    /// Fire-and-forget reputation adjustment.
    fn update_score(&self, address: &str, delta: i32);

    /// Remembers an address learned from a peer. Returns true if it was new.
    fn add(&self, address: &str) -> bool;
}

/// Local block header chain.
pub trait BlockRepository: Send + Sync {
    fn last_height(&self) -> u64;

    fn hash_at(&self, height: u64) -> Option<Hash>;

    fn contains(&self, hash: &Hash) -> bool;
}

#[derive(Default)]
pub struct MemoryPeerRepository {
    scores: RwLock<HashMap<String, i32>>,
}

impl MemoryPeerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, address: &str) -> Option<i32> {
        self.scores.read().get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.read().is_empty()
    }
}

impl PeerRepository for MemoryPeerRepository {
    fn update_score(&self, address: &str, delta: i32) {
        let mut scores = self.scores.write();
        let score = scores.entry(address.to_string()).or_insert(0);
        *score = score.saturating_add(delta);
        debug!("Peer {} score {} ({:+})", address, score, delta);
    }

    fn add(&self, address: &str) -> bool {
        let mut scores = self.scores.write();
        if scores.contains_key(address) {
            return false;
        }
        scores.insert(address.to_string(), 0);
        true
    }
}

struct Chain {
    hashes: Vec<Hash>,
    known: HashSet<Hash>,
}

/// Header chain held in memory, starting at a genesis hash (height 0).
pub struct MemoryBlockRepository {
    chain: RwLock<Chain>,
}

impl MemoryBlockRepository {
    pub fn new(genesis: Hash) -> Self {
        Self {
            chain: RwLock::new(Chain {
                hashes: vec![genesis],
                known: HashSet::from([genesis]),
            }),
        }
    }

    /// Appends a block hash at the next height and returns that height.
    pub fn push(&self, hash: Hash) -> u64 {
        let mut chain = self.chain.write();
        let height = chain.hashes.len() as u64;
        chain.hashes.push(hash);
        chain.known.insert(hash);
        height
    }
}

impl BlockRepository for MemoryBlockRepository {
    fn last_height(&self) -> u64 {
        // never empty: genesis is inserted on construction
        self.chain.read().hashes.len().saturating_sub(1) as u64
    }

    fn hash_at(&self, height: u64) -> Option<Hash> {
        let index = usize::try_from(height).ok()?;
        self.chain.read().hashes.get(index).copied()
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.chain.read().known.contains(hash)
    }
}
