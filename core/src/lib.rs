pub mod block;
pub mod config;
pub mod crypto;
pub mod mempool;
pub mod transaction;

pub use block::*;
pub use crypto::*;
pub use mempool::*;
pub use transaction::*;
