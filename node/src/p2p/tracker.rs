//! Remembers which transactions this node asked its peer for, so requests
//! the peer silently dropped get sent again.

use crate::p2p::messages::{InventoryType, P2pMessage};
use log::debug;
use parking_lot::Mutex;
use spynode_core::config::MAX_INV_PER_MESSAGE;
use spynode_core::crypto::Hash;
use spynode_core::mempool::{MemPool, RequestStatus};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("peer did not deliver tx {txid} after {attempts} requests")]
    Unresponsive { txid: Hash, attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
struct TrackedRequest {
    requested_at: Instant,
    attempts: u32,
}

pub struct TxTracker {
    requests: Mutex<HashMap<Hash, TrackedRequest>>,
    timeout: Duration,
    max_attempts: u32,
}

impl TxTracker {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            timeout,
            max_attempts,
        }
    }

    pub fn add(&self, txid: Hash) {
        self.add_at(txid, Instant::now());
    }

    pub fn add_at(&self, txid: Hash, now: Instant) {
        self.requests.lock().entry(txid).or_insert(TrackedRequest {
            requested_at: now,
            attempts: 1,
        });
    }

    /// Stops tracking transactions that were received or confirmed.
    pub fn remove(&self, txids: &[Hash]) {
        let mut requests = self.requests.lock();
        for txid in txids {
            requests.remove(txid);
        }
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.requests.lock().contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Returns the getdata messages that should be sent now.
    pub fn check(&self, mempool: &MemPool) -> Result<Vec<P2pMessage>, TrackerError> {
        self.check_at(mempool, Instant::now())
    }

    pub fn check_at(&self, mempool: &MemPool, now: Instant) -> Result<Vec<P2pMessage>, TrackerError> {
        let mut requests = self.requests.lock();
        let mut wanted = Vec::new();
        let mut unresponsive = None;

        requests.retain(|txid, request| {
            if mempool.transaction_exists(txid) {
                return false;
            }
            if now.saturating_duration_since(request.requested_at) < self.timeout {
                return true;
            }

            match mempool.add_request_at(txid, now) {
                RequestStatus::AlreadyHave => false,
                // someone else asked recently, look again next cycle
                RequestStatus::InFlight => true,
                RequestStatus::Request => {
                    request.attempts += 1;
                    request.requested_at = now;
                    if request.attempts > self.max_attempts && unresponsive.is_none() {
                        unresponsive = Some(TrackerError::Unresponsive {
                            txid: *txid,
                            attempts: request.attempts - 1,
                        });
                    }
                    wanted.push(*txid);
                    true
                }
            }
        });

        if let Some(err) = unresponsive {
            return Err(err);
        }

        if !wanted.is_empty() {
            debug!("Re-requesting {} tx(s)", wanted.len());
        }
        Ok(wanted
            .chunks(MAX_INV_PER_MESSAGE)
            .map(|chunk| P2pMessage::GetData {
                object_type: InventoryType::Transaction,
                hashes: chunk.to_vec(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spynode_core::transaction::{OutPoint, Transaction, TransactionInput, TransactionOutput};

    fn tx(n: u8) -> Transaction {
        Transaction::new(
            vec![TransactionInput {
                previous_output: OutPoint::new(Hash([n; 32]), 0),
                script: vec![],
                sequence: 0,
            }],
            vec![TransactionOutput {
                value: 1,
                script: vec![],
            }],
        )
    }

    fn get_data(hashes: Vec<Hash>) -> P2pMessage {
        P2pMessage::GetData {
            object_type: InventoryType::Transaction,
            hashes,
        }
    }

    #[test]
    fn nothing_to_send_before_timeout() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new(Duration::from_secs(30), 3);
        let start = Instant::now();
        tracker.add_at(Hash([1; 32]), start);

        assert_eq!(tracker.check_at(&mempool, start + Duration::from_secs(29)), Ok(vec![]));
        assert!(tracker.contains(&Hash([1; 32])));
    }

    #[test]
    fn stale_request_is_sent_again() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new(Duration::from_secs(30), 3);
        let start = Instant::now();
        let txid = Hash([1; 32]);
        tracker.add_at(txid, start);

        let later = start + Duration::from_secs(31);
        assert_eq!(tracker.check_at(&mempool, later), Ok(vec![get_data(vec![txid])]));
        // the retry reset the clock
        assert_eq!(tracker.check_at(&mempool, later + Duration::from_secs(1)), Ok(vec![]));
    }

    #[test]
    fn received_tx_is_dropped() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new(Duration::from_secs(30), 3);
        let t = tx(1);
        tracker.add(t.txid());
        mempool.add_transaction(&t);

        assert_eq!(tracker.check(&mempool), Ok(vec![]));
        assert!(tracker.is_empty());
    }

    #[test]
    fn request_in_flight_elsewhere_is_not_duplicated() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new(Duration::from_secs(30), 3);
        let start = Instant::now();
        let txid = Hash([1; 32]);
        tracker.add_at(txid, start);

        let later = start + Duration::from_secs(31);
        // another peer's node just asked for it
        assert!(mempool.add_request_at(&txid, later).should_request());
        assert_eq!(tracker.check_at(&mempool, later), Ok(vec![]));
        assert!(tracker.contains(&txid));
    }

    #[test]
    fn remove_stops_tracking() {
        let tracker = TxTracker::new(Duration::from_secs(30), 3);
        tracker.add(Hash([1; 32]));
        tracker.add(Hash([2; 32]));
        tracker.remove(&[Hash([1; 32])]);
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.contains(&Hash([1; 32])));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new(Duration::from_secs(10), 2);
        let txid = Hash([1; 32]);
        let mut now = Instant::now();
        tracker.add_at(txid, now);

        now += Duration::from_secs(11);
        assert_eq!(tracker.check_at(&mempool, now), Ok(vec![get_data(vec![txid])]));

        now += Duration::from_secs(11);
        assert_eq!(
            tracker.check_at(&mempool, now),
            Err(TrackerError::Unresponsive { txid, attempts: 2 })
        );
    }
}
