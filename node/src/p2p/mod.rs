pub mod handlers;
pub mod messages;
pub mod node;
pub mod peer;
pub mod state;
pub mod tracker;

pub use messages::{InventoryType, MessageKind, P2pMessage};
pub use node::{NodeConfig, NodeError, UntrustedNode};
pub use tracker::TxTracker;
