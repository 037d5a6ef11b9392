//! Non-persistent pool of announced transactions that haven't confirmed yet.
//!
//! The pool is shared by every peer connection. It exists to stop duplicate
//! getdata traffic and to surface double spends between unconfirmed
//! transactions; it does not validate anything.
//!
//! `txs` and `inputs` are always updated together under one lock, so for
//! every `(outpoint, hash)` pair in `inputs` there is an entry for `hash`
//! whose outpoints include `outpoint`.

use crate::config::REQUEST_THROTTLE;
use crate::crypto::Hash;
use crate::transaction::{OutPoint, Transaction};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Outcome of [`MemPool::add_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The transaction is already in the pool; never re-request it.
    AlreadyHave,
    /// Nobody asked for it recently; send a getdata now.
    Request,
    /// Another request went out less than [`REQUEST_THROTTLE`] ago.
    InFlight,
}

impl RequestStatus {
    pub fn already_have(self) -> bool {
        self == RequestStatus::AlreadyHave
    }

    pub fn should_request(self) -> bool {
        self == RequestStatus::Request
    }
}

#[derive(Debug, Clone)]
pub struct MemPoolEntry {
    pub hash: Hash,
    pub first_seen: Instant,
    pub outpoints: Vec<OutPoint>,
}

impl MemPoolEntry {
    fn new(hash: Hash, first_seen: Instant, tx: &Transaction) -> Self {
        Self {
            hash,
            first_seen,
            outpoints: tx.outpoints().copied().collect(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    txs: HashMap<Hash, MemPoolEntry>,
    inputs: HashMap<OutPoint, Vec<Hash>>, // spenders of each outpoint
    requests: HashMap<Hash, Instant>,     // last getdata per txid
    last_sweep: Option<Instant>,
}

impl PoolInner {
    /// Drops request records old enough to no longer throttle anything.
    /// Runs at most once per throttle window.
    fn sweep_requests(&mut self, now: Instant) {
        let due = self
            .last_sweep
            .is_none_or(|last| now.saturating_duration_since(last) >= REQUEST_THROTTLE);
        if !due {
            return;
        }
        self.requests
            .retain(|_, requested_at| now.saturating_duration_since(*requested_at) < REQUEST_THROTTLE);
        self.last_sweep = Some(now);
    }

    fn remove(&mut self, hash: &Hash) -> bool {
        let Some(entry) = self.txs.remove(hash) else {
            return false;
        };

        for outpoint in &entry.outpoints {
            if let Some(spenders) = self.inputs.get_mut(outpoint) {
                spenders.retain(|spender| spender != hash);
                if spenders.is_empty() {
                    self.inputs.remove(outpoint);
                }
            }
        }
        true
    }
}

#[derive(Default)]
pub struct MemPool {
    inner: Mutex<PoolInner>,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an outbound request for `txid`.
    /// This is the only thing preventing the same tx from being requested
    /// from every peer that announces it.
    pub fn add_request(&self, txid: &Hash) -> RequestStatus {
        self.add_request_at(txid, Instant::now())
    }

    pub fn add_request_at(&self, txid: &Hash, now: Instant) -> RequestStatus {
        let mut pool = self.inner.lock();

        if pool.txs.contains_key(txid) {
            return RequestStatus::AlreadyHave;
        }

        let in_flight = pool
            .requests
            .get(txid)
            .is_some_and(|requested_at| now.saturating_duration_since(*requested_at) < REQUEST_THROTTLE);
        if in_flight {
            return RequestStatus::InFlight;
        }

        pool.sweep_requests(now);
        pool.requests.insert(*txid, now);
        RequestStatus::Request
    }

    /// Adds a transaction and indexes the outpoints it spends.
    ///
    /// Returns the other tracked transactions that already spend one of the
    /// same outpoints (each listed once) and whether the tx was added.
    /// Conflicting entries are left in place; [`MemPool::conflicting`] is the
    /// call that evicts them.
    pub fn add_transaction(&self, tx: &Transaction) -> (Vec<Hash>, bool) {
        let hash = tx.txid();
        let mut guard = self.inner.lock();
        let pool = &mut *guard;

        if pool.txs.contains_key(&hash) {
            return (Vec::new(), false);
        }

        let entry = MemPoolEntry::new(hash, Instant::now(), tx);
        let mut conflicts = Vec::new();
        for outpoint in &entry.outpoints {
            let spenders = pool.inputs.entry(*outpoint).or_default();
            for other in spenders.iter() {
                if *other != hash && !conflicts.contains(other) {
                    conflicts.push(*other);
                }
            }
            if !spenders.contains(&hash) {
                spenders.push(hash);
            }
        }

        pool.requests.remove(&hash);
        pool.txs.insert(hash, entry);

        if !conflicts.is_empty() {
            debug!("Tx {} conflicts with {} pooled tx(s)", hash, conflicts.len());
        }
        (conflicts, true)
    }

    /// Removes a transaction and unindexes its outpoints.
    /// Returns true if the tx was in the pool.
    pub fn remove_transaction(&self, hash: &Hash) -> bool {
        self.inner.lock().remove(hash)
    }

    pub fn transaction_exists(&self, hash: &Hash) -> bool {
        self.inner.lock().txs.contains_key(hash)
    }

    /// Returns the pooled transactions spending any outpoint that `tx` spends,
    /// and evicts them. `tx` itself is never reported.
    pub fn conflicting(&self, tx: &Transaction) -> Vec<Hash> {
        let own = tx.txid();
        let mut pool = self.inner.lock();
        let mut result = Vec::new();

        for outpoint in tx.outpoints() {
            let Some(spenders) = pool.inputs.get(outpoint).cloned() else {
                continue;
            };
            for hash in spenders {
                if hash == own || result.contains(&hash) {
                    continue;
                }
                pool.remove(&hash);
                result.push(hash);
            }
        }

        if !result.is_empty() {
            debug!("Evicted {} tx(s) double spent by {}", result.len(), own);
        }
        result
    }

    pub fn first_seen(&self, hash: &Hash) -> Option<Instant> {
        self.inner.lock().txs.get(hash).map(|entry| entry.first_seen)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().txs.is_empty()
    }

    #[cfg(test)]
    fn pending_requests(&self) -> usize {
        self.inner.lock().requests.len()
    }

    #[cfg(test)]
    fn spenders(&self, outpoint: &OutPoint) -> Option<Vec<Hash>> {
        self.inner.lock().inputs.get(outpoint).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionInput, TransactionOutput};
    use std::time::Duration;

    fn outpoint(n: u8, vout: u32) -> OutPoint {
        OutPoint::new(Hash([n; 32]), vout)
    }

    fn tx_spending(outpoints: &[OutPoint], value: u64) -> Transaction {
        Transaction::new(
            outpoints
                .iter()
                .map(|op| TransactionInput {
                    previous_output: *op,
                    script: vec![],
                    sequence: u32::MAX,
                })
                .collect(),
            vec![TransactionOutput {
                value,
                script: vec![0x51],
            }],
        )
    }

    #[test]
    fn add_transaction_is_idempotent() {
        let pool = MemPool::new();
        let tx = tx_spending(&[outpoint(1, 0)], 10);

        assert_eq!(pool.add_transaction(&tx), (vec![], true));
        assert_eq!(pool.add_transaction(&tx), (vec![], false));
        assert_eq!(pool.len(), 1);
        assert!(pool.transaction_exists(&tx.txid()));
    }

    #[test]
    fn add_transaction_reports_but_keeps_existing_spenders() {
        let pool = MemPool::new();
        let a = tx_spending(&[outpoint(1, 0), outpoint(1, 1)], 10);
        let b = tx_spending(&[outpoint(1, 0), outpoint(1, 1)], 9);

        pool.add_transaction(&a);
        let (conflicts, added) = pool.add_transaction(&b);

        assert!(added);
        // both inputs collide but `a` is listed once
        assert_eq!(conflicts, vec![a.txid()]);
        assert!(pool.transaction_exists(&a.txid()));
        assert_eq!(
            pool.spenders(&outpoint(1, 0)),
            Some(vec![a.txid(), b.txid()])
        );
    }

    #[test]
    fn add_request_throttles_for_three_seconds() {
        let pool = MemPool::new();
        let txid = Hash([9; 32]);
        let start = Instant::now();

        assert_eq!(pool.add_request_at(&txid, start), RequestStatus::Request);
        assert_eq!(
            pool.add_request_at(&txid, start + Duration::from_secs(1)),
            RequestStatus::InFlight
        );
        assert_eq!(
            pool.add_request_at(&txid, start + Duration::from_secs(3)),
            RequestStatus::Request
        );
        // the retry restarted the window
        assert_eq!(
            pool.add_request_at(&txid, start + Duration::from_secs(4)),
            RequestStatus::InFlight
        );
    }

    #[test]
    fn stale_request_records_are_pruned() {
        let pool = MemPool::new();
        let start = Instant::now();
        for n in 0..10_000u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&n.to_le_bytes());
            pool.add_request_at(&Hash(bytes), start);
        }
        assert_eq!(pool.pending_requests(), 10_000);

        let later = start + Duration::from_secs(3600);
        assert!(pool.add_request_at(&Hash([0xff; 32]), later).should_request());
        assert_eq!(pool.pending_requests(), 1);
    }

    #[test]
    fn recent_request_records_survive_a_sweep() {
        let pool = MemPool::new();
        let start = Instant::now();
        let recent = Hash([1; 32]);
        pool.add_request_at(&Hash([2; 32]), start);
        pool.add_request_at(&recent, start + Duration::from_secs(4));

        // sweep at +4s dropped only the record from +0s
        assert_eq!(pool.pending_requests(), 1);
        assert_eq!(
            pool.add_request_at(&recent, start + Duration::from_secs(5)),
            RequestStatus::InFlight
        );
    }

    #[test]
    fn add_request_for_pooled_tx_is_already_have() {
        let pool = MemPool::new();
        let tx = tx_spending(&[outpoint(1, 0)], 10);
        pool.add_transaction(&tx);

        let status = pool.add_request(&tx.txid());
        assert!(status.already_have());
        assert!(!status.should_request());
    }

    #[test]
    fn conflicting_evicts_double_spent_tx() {
        let pool = MemPool::new();
        let tx1 = tx_spending(&[outpoint(1, 0)], 10);
        let tx2 = tx_spending(&[outpoint(1, 0)], 8);

        assert_eq!(pool.add_transaction(&tx1), (vec![], true));
        assert_eq!(pool.add_transaction(&tx1), (vec![], false));

        assert_eq!(pool.conflicting(&tx2), vec![tx1.txid()]);
        assert!(!pool.transaction_exists(&tx1.txid()));
        assert!(pool.is_empty());
        assert_eq!(pool.spenders(&outpoint(1, 0)), None);
    }

    #[test]
    fn conflicting_without_overlap_is_empty() {
        let pool = MemPool::new();
        let tx1 = tx_spending(&[outpoint(1, 0)], 10);
        let tx2 = tx_spending(&[outpoint(2, 0)], 10);
        pool.add_transaction(&tx1);

        assert!(pool.conflicting(&tx2).is_empty());
        assert!(pool.transaction_exists(&tx1.txid()));
    }

    #[test]
    fn conflicting_lists_each_loser_once() {
        let pool = MemPool::new();
        let a = tx_spending(&[outpoint(1, 0), outpoint(1, 1)], 10);
        let b = tx_spending(&[outpoint(2, 0)], 10);
        let c = tx_spending(&[outpoint(1, 0), outpoint(1, 1), outpoint(2, 0)], 5);
        pool.add_transaction(&a);
        pool.add_transaction(&b);

        assert_eq!(pool.conflicting(&c), vec![a.txid(), b.txid()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_keeps_other_co_spenders_indexed() {
        let pool = MemPool::new();
        let op = outpoint(1, 0);
        let a = tx_spending(&[op], 10);
        let b = tx_spending(&[op], 9);
        pool.add_transaction(&a);
        pool.add_transaction(&b);

        assert!(pool.remove_transaction(&a.txid()));
        assert_eq!(pool.spenders(&op), Some(vec![b.txid()]));

        assert!(pool.remove_transaction(&b.txid()));
        assert_eq!(pool.spenders(&op), None);
    }

    #[test]
    fn remove_absent_is_noop() {
        let pool = MemPool::new();
        assert!(!pool.remove_transaction(&Hash([3; 32])));
        assert!(pool.is_empty());
    }

    #[test]
    fn adding_tx_clears_pending_request() {
        let pool = MemPool::new();
        let tx = tx_spending(&[outpoint(1, 0)], 10);
        let txid = tx.txid();

        assert!(pool.add_request(&txid).should_request());
        pool.add_transaction(&tx);
        pool.remove_transaction(&txid);

        // the old request record went away with the add
        assert!(pool.add_request(&txid).should_request());
    }

    #[test]
    fn first_seen_is_recorded() {
        let pool = MemPool::new();
        let before = Instant::now();
        let tx = tx_spending(&[outpoint(1, 0)], 10);
        pool.add_transaction(&tx);

        let seen = pool.first_seen(&tx.txid()).unwrap();
        assert!(seen >= before);
        assert_eq!(pool.first_seen(&Hash([5; 32])), None);
    }
}
