// node/src/p2p/messages.rs

use bincode::{Decode, Encode};
use spynode_core::block::BlockHeader;
use spynode_core::crypto::Hash;
use spynode_core::transaction::Transaction;
use std::fmt;

/// (inv/getdata/notfound)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum InventoryType {
    Error,
    Transaction,
    Block,
}

/// message type
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum P2pMessage {
    Version {
        version: u32,
        user_agent: String,
        height: u64,
        timestamp: i64,
        nonce: u64,
    },
    VerAck,
    GetHeaders {
        version: u32,
        locator_hashes: Vec<Hash>,
        stop_hash: Option<Hash>,
    },
    Headers {
        headers: Vec<BlockHeader>,
    },
    Inv {
        object_type: InventoryType,
        hashes: Vec<Hash>,
    },
    GetData {
        object_type: InventoryType,
        hashes: Vec<Hash>,
    },
    NotFound {
        object_type: InventoryType,
        hashes: Vec<Hash>,
    },
    Tx(Transaction),
    GetAddr,
    Addr {
        addresses: Vec<String>,
    },
    MemPool,
    Reject {
        message: String,
        reason: String,
    },
    Ping(u64),
    Pong(u64),
}

/// Tag used as the key of the command dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Version,
    VerAck,
    GetHeaders,
    Headers,
    Inv,
    GetData,
    NotFound,
    Tx,
    GetAddr,
    Addr,
    MemPool,
    Reject,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn command(self) -> &'static str {
        match self {
            MessageKind::Version => "version",
            MessageKind::VerAck => "verack",
            MessageKind::GetHeaders => "getheaders",
            MessageKind::Headers => "headers",
            MessageKind::Inv => "inv",
            MessageKind::GetData => "getdata",
            MessageKind::NotFound => "notfound",
            MessageKind::Tx => "tx",
            MessageKind::GetAddr => "getaddr",
            MessageKind::Addr => "addr",
            MessageKind::MemPool => "mempool",
            MessageKind::Reject => "reject",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl P2pMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            P2pMessage::Version { .. } => MessageKind::Version,
            P2pMessage::VerAck => MessageKind::VerAck,
            P2pMessage::GetHeaders { .. } => MessageKind::GetHeaders,
            P2pMessage::Headers { .. } => MessageKind::Headers,
            P2pMessage::Inv { .. } => MessageKind::Inv,
            P2pMessage::GetData { .. } => MessageKind::GetData,
            P2pMessage::NotFound { .. } => MessageKind::NotFound,
            P2pMessage::Tx(_) => MessageKind::Tx,
            P2pMessage::GetAddr => MessageKind::GetAddr,
            P2pMessage::Addr { .. } => MessageKind::Addr,
            P2pMessage::MemPool => MessageKind::MemPool,
            P2pMessage::Reject { .. } => MessageKind::Reject,
            P2pMessage::Ping(_) => MessageKind::Ping,
            P2pMessage::Pong(_) => MessageKind::Pong,
        }
    }

    pub fn command(&self) -> &'static str {
        self.kind().command()
    }
}
