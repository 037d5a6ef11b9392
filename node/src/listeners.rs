//! Capabilities supplied by the embedding application. The command handlers
//! only call these; concrete variants live with whoever runs the node.

use spynode_core::crypto::Hash;
use spynode_core::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Seen on the network, not yet in a block.
    Unconfirmed,
    /// Evicted because another unconfirmed tx spends the same outpoint.
    Cancelled,
}

pub trait Listener: Send + Sync {
    /// Called once for every relevant transaction added to the mempool.
    fn handle_tx(&self, tx: &Transaction);

    fn handle_tx_state(&self, state: TxState, txid: &Hash);
}

pub trait TxFilter: Send + Sync {
    fn is_relevant(&self, tx: &Transaction) -> bool;
}

/// A tx passes when there are no filters or any filter accepts it.
pub fn matches_filters(filters: &[std::sync::Arc<dyn TxFilter>], tx: &Transaction) -> bool {
    filters.is_empty() || filters.iter().any(|filter| filter.is_relevant(tx))
}
