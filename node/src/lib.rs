pub mod listeners;
pub mod p2p;
pub mod storage;

pub use listeners::{Listener, TxFilter, TxState};
pub use p2p::{NodeConfig, NodeError, UntrustedNode};
