//! Command dispatch for messages received from an untrusted peer.
//!
//! The table maps a [`MessageKind`] to the handler for it and is built once
//! per node. Handlers return the replies to queue; an error is a protocol
//! violation and ends the connection.

use crate::listeners::{Listener, TxFilter, TxState, matches_filters};
use crate::p2p::messages::{InventoryType, MessageKind, P2pMessage};
use crate::p2p::state::ConnectionState;
use crate::p2p::tracker::TxTracker;
use crate::storage::{BlockRepository, PeerRepository};
use log::{debug, info, warn};
use parking_lot::Mutex;
use spynode_core::config::{MAX_INV_PER_MESSAGE, MIN_PROTOCOL_VERSION};
use spynode_core::mempool::{MemPool, RequestStatus};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("peer sent a second version message")]
    DuplicateVersion,
    #[error("peer protocol version {version} is below the minimum {minimum}")]
    ObsoleteVersion { version: u32, minimum: u32 },
    #[error("{count} headers do not connect to the local chain")]
    ChainMismatch { count: usize },
    #[error("{kind} carries {count} entries, limit is {limit}")]
    OversizedInventory {
        kind: MessageKind,
        count: usize,
        limit: usize,
    },
}

pub trait CommandHandler: Send + Sync {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError>;
}

pub type CommandHandlers = HashMap<MessageKind, Box<dyn CommandHandler>>;

/// Everything the untrusted handlers read or write.
#[derive(Clone)]
pub struct HandlerContext {
    pub state: Arc<Mutex<ConnectionState>>,
    pub peers: Arc<dyn PeerRepository>,
    pub blocks: Arc<dyn BlockRepository>,
    pub tracker: Arc<TxTracker>,
    pub mempool: Arc<MemPool>,
    pub listeners: Vec<Arc<dyn Listener>>,
    pub filters: Vec<Arc<dyn TxFilter>>,
}

pub fn untrusted_handlers(ctx: &HandlerContext) -> CommandHandlers {
    let mut handlers: CommandHandlers = HashMap::new();
    handlers.insert(
        MessageKind::Version,
        Box::new(VersionHandler {
            state: ctx.state.clone(),
            min_version: MIN_PROTOCOL_VERSION,
        }),
    );
    handlers.insert(MessageKind::Ping, Box::new(PingHandler));
    handlers.insert(
        MessageKind::Headers,
        Box::new(HeadersHandler {
            state: ctx.state.clone(),
            blocks: ctx.blocks.clone(),
        }),
    );
    handlers.insert(
        MessageKind::Inv,
        Box::new(InvHandler {
            mempool: ctx.mempool.clone(),
            tracker: ctx.tracker.clone(),
        }),
    );
    handlers.insert(
        MessageKind::Tx,
        Box::new(TxHandler {
            mempool: ctx.mempool.clone(),
            tracker: ctx.tracker.clone(),
            listeners: ctx.listeners.clone(),
            filters: ctx.filters.clone(),
        }),
    );
    handlers.insert(
        MessageKind::Addr,
        Box::new(AddrHandler {
            peers: ctx.peers.clone(),
        }),
    );
    handlers.insert(MessageKind::GetData, Box::new(GetDataHandler));
    handlers.insert(MessageKind::Reject, Box::new(RejectHandler));
    handlers
}

/// Runs the handler registered for the message's kind. Kinds without a
/// handler (verack, pong, ...) need no action.
pub fn handle_message(handlers: &CommandHandlers, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
    match handlers.get(&msg.kind()) {
        Some(handler) => handler.handle(msg),
        None => {
            debug!("No handler for {} message", msg.command());
            Ok(Vec::new())
        }
    }
}

struct VersionHandler {
    state: Arc<Mutex<ConnectionState>>,
    min_version: u32,
}

impl CommandHandler for VersionHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        let P2pMessage::Version {
            version,
            user_agent,
            height,
            ..
        } = msg
        else {
            return Ok(Vec::new());
        };

        if *version < self.min_version {
            return Err(HandlerError::ObsoleteVersion {
                version: *version,
                minimum: self.min_version,
            });
        }
        if !self.state.lock().mark_version_received(*version, user_agent, *height) {
            return Err(HandlerError::DuplicateVersion);
        }

        info!("Peer version {} {} at height {}", version, user_agent, height);
        Ok(vec![P2pMessage::VerAck])
    }
}

struct PingHandler;

impl CommandHandler for PingHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        match msg {
            P2pMessage::Ping(nonce) => Ok(vec![P2pMessage::Pong(*nonce)]),
            _ => Ok(Vec::new()),
        }
    }
}

/// Verifies the reply to our header request: the peer shares our chain if
/// any header it sent is, or builds on, a block we know.
struct HeadersHandler {
    state: Arc<Mutex<ConnectionState>>,
    blocks: Arc<dyn BlockRepository>,
}

impl CommandHandler for HeadersHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        let P2pMessage::Headers { headers } = msg else {
            return Ok(Vec::new());
        };
        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let linked = headers
            .iter()
            .any(|header| self.blocks.contains(&header.previous_hash) || self.blocks.contains(&header.hash()));
        if !linked {
            return Err(HandlerError::ChainMismatch { count: headers.len() });
        }

        if self.state.lock().mark_verified() {
            info!("Peer chain verified with {} headers", headers.len());
        }
        Ok(Vec::new())
    }
}

struct InvHandler {
    mempool: Arc<MemPool>,
    tracker: Arc<TxTracker>,
}

impl CommandHandler for InvHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        let P2pMessage::Inv { object_type, hashes } = msg else {
            return Ok(Vec::new());
        };
        check_inventory_size(MessageKind::Inv, hashes.len())?;
        if *object_type != InventoryType::Transaction {
            return Ok(Vec::new());
        }

        let mut wanted = Vec::new();
        for txid in hashes {
            if self.mempool.add_request(txid) == RequestStatus::Request {
                self.tracker.add(*txid);
                wanted.push(*txid);
            }
        }

        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Requesting {} of {} announced tx(s)", wanted.len(), hashes.len());
        Ok(vec![P2pMessage::GetData {
            object_type: InventoryType::Transaction,
            hashes: wanted,
        }])
    }
}

struct TxHandler {
    mempool: Arc<MemPool>,
    tracker: Arc<TxTracker>,
    listeners: Vec<Arc<dyn Listener>>,
    filters: Vec<Arc<dyn TxFilter>>,
}

impl CommandHandler for TxHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        let P2pMessage::Tx(tx) = msg else {
            return Ok(Vec::new());
        };
        let txid = tx.txid();
        self.tracker.remove(&[txid]);

        if self.mempool.transaction_exists(&txid) {
            return Ok(Vec::new());
        }
        if !matches_filters(&self.filters, tx) {
            return Ok(Vec::new());
        }

        for cancelled in self.mempool.conflicting(tx) {
            info!("Tx {} double spent by {}", cancelled, txid);
            for listener in &self.listeners {
                listener.handle_tx_state(TxState::Cancelled, &cancelled);
            }
        }

        let (_, added) = self.mempool.add_transaction(tx);
        if added {
            for listener in &self.listeners {
                listener.handle_tx(tx);
                listener.handle_tx_state(TxState::Unconfirmed, &txid);
            }
        }
        Ok(Vec::new())
    }
}

struct AddrHandler {
    peers: Arc<dyn PeerRepository>,
}

impl CommandHandler for AddrHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        let P2pMessage::Addr { addresses } = msg else {
            return Ok(Vec::new());
        };
        check_inventory_size(MessageKind::Addr, addresses.len())?;

        let added = addresses.iter().filter(|address| self.peers.add(address)).count();
        debug!("Received {} addresses, {} new", addresses.len(), added);
        Ok(Vec::new())
    }
}

/// This client does not serve data, so every request is answered with notfound.
struct GetDataHandler;

impl CommandHandler for GetDataHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        let P2pMessage::GetData { object_type, hashes } = msg else {
            return Ok(Vec::new());
        };
        check_inventory_size(MessageKind::GetData, hashes.len())?;
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![P2pMessage::NotFound {
            object_type: *object_type,
            hashes: hashes.clone(),
        }])
    }
}

struct RejectHandler;

impl CommandHandler for RejectHandler {
    fn handle(&self, msg: &P2pMessage) -> Result<Vec<P2pMessage>, HandlerError> {
        if let P2pMessage::Reject { message, reason } = msg {
            warn!("Peer rejected {} : {}", message, reason);
        }
        Ok(Vec::new())
    }
}

fn check_inventory_size(kind: MessageKind, count: usize) -> Result<(), HandlerError> {
    if count > MAX_INV_PER_MESSAGE {
        return Err(HandlerError::OversizedInventory {
            kind,
            count,
            limit: MAX_INV_PER_MESSAGE,
        });
    }
    Ok(())
}
