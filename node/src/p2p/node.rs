// node/src/p2p/node.rs

//! A client connection to a single peer that is not trusted.
//!
//! The node performs the version handshake, checks the peer follows the same
//! chain by asking for recent headers, then requests peer addresses and the
//! peer's mempool. From that point it feeds announced transactions into the
//! shared [`MemPool`] and reports double spends to the listeners.
//!
//! Three tasks run per connection: one reads and dispatches messages, one
//! watches the handshake deadlines and one drains the outgoing queue to the
//! socket. Any of them can stop the node; `run` returns when all have exited.

use crate::listeners::{Listener, TxFilter};
use crate::p2p::handlers::{CommandHandlers, HandlerContext, handle_message, untrusted_handlers};
use crate::p2p::messages::P2pMessage;
use crate::p2p::peer::{self, PeerReader, PeerWriter};
use crate::p2p::state::{ConnectionState, HandshakeTimeouts};
use crate::p2p::tracker::{TrackerError, TxTracker};
use crate::storage::{BlockRepository, PeerRepository};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use spynode_config::Config;
use spynode_core::config::{
    FAILURE_SCORE_PENALTY, MAX_MESSAGE_SIZE, OUTGOING_QUEUE_CAPACITY, PROTOCOL_VERSION, UNTRUSTED_HEADER_COUNT,
    UNTRUSTED_HEADER_DELTA, USER_AGENT, VERIFIED_SCORE_BONUS,
};
use spynode_core::crypto::Hash;
use spynode_core::mempool::MemPool;
use spynode_core::transaction::Transaction;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to connect: {0}")]
    Connect(#[from] std::io::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("node is not active")]
    Inactive,
    #[error("node is already running")]
    AlreadyRunning,
    #[error("no local block hashes to build a header locator from")]
    EmptyLocator,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub handshake: HandshakeTimeouts,
    pub timeout_check_interval: Duration,
    pub tx_request_timeout: Duration,
    pub max_tx_request_attempts: u32,
    /// How far below the local tip the header locator starts.
    pub header_delta: u64,
    pub header_count: usize,
    pub max_frame_length: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake: HandshakeTimeouts::default(),
            timeout_check_interval: Duration::from_secs(10),
            tx_request_timeout: Duration::from_secs(30),
            max_tx_request_attempts: 5,
            header_delta: UNTRUSTED_HEADER_DELTA,
            header_count: UNTRUSTED_HEADER_COUNT,
            max_frame_length: MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&Config> for NodeConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            user_agent: cfg.user_agent.clone(),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            handshake: HandshakeTimeouts {
                version: Duration::from_secs(cfg.handshake_timeout_secs),
                verification: Duration::from_secs(cfg.verify_timeout_secs),
            },
            timeout_check_interval: Duration::from_secs(cfg.timeout_check_interval_secs),
            tx_request_timeout: Duration::from_secs(cfg.tx_request_timeout_secs),
            max_tx_request_attempts: cfg.max_tx_request_attempts,
            header_delta: cfg.header_delta,
            header_count: cfg.header_count,
            max_frame_length: cfg.max_frame_length,
        }
    }
}

pub struct UntrustedNode {
    address: String,
    config: NodeConfig,
    state: Arc<Mutex<ConnectionState>>,
    peers: Arc<dyn PeerRepository>,
    blocks: Arc<dyn BlockRepository>,
    tracker: Arc<TxTracker>,
    mempool: Arc<MemPool>,
    handlers: CommandHandlers,

    outgoing: Mutex<Option<mpsc::Sender<P2pMessage>>>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<P2pMessage>>>,
    stop_token: CancellationToken,
    active: AtomicBool,
}

impl UntrustedNode {
    pub fn new(
        address: impl Into<String>,
        config: NodeConfig,
        peers: Arc<dyn PeerRepository>,
        blocks: Arc<dyn BlockRepository>,
        mempool: Arc<MemPool>,
        listeners: Vec<Arc<dyn Listener>>,
        filters: Vec<Arc<dyn TxFilter>>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ConnectionState::new(config.handshake)));
        let tracker = Arc::new(TxTracker::new(config.tx_request_timeout, config.max_tx_request_attempts));
        let handlers = untrusted_handlers(&HandlerContext {
            state: state.clone(),
            peers: peers.clone(),
            blocks: blocks.clone(),
            tracker: tracker.clone(),
            mempool: mempool.clone(),
            listeners,
            filters,
        });
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);

        Self {
            address: address.into(),
            config,
            state,
            peers,
            blocks,
            tracker,
            mempool,
            handlers,
            outgoing: Mutex::new(Some(tx)),
            outgoing_rx: Mutex::new(Some(rx)),
            stop_token: CancellationToken::new(),
            active: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.stop_token.is_cancelled()
    }

    /// Connects and runs the connection until the peer leaves, misbehaves
    /// or `stop` is called. A node runs at most once.
    pub async fn run(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.stop_token.is_cancelled() {
            return Err(NodeError::Inactive);
        }
        let receiver = self.outgoing_rx.lock().take().ok_or(NodeError::AlreadyRunning)?;

        info!("Connecting to {}", self.address);
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(NodeError::Connect(e))),
            Err(_) => return Err(self.connect_failed(NodeError::ConnectTimeout(self.config.connect_timeout))),
        };

        self.active.store(true, Ordering::SeqCst);
        self.state.lock().mark_connected(Instant::now());
        info!("Connected to {}", self.address);

        let (reader, writer) = peer::split(stream, self.config.max_frame_length);
        self.queue(self.version_message()).await?;

        let incoming = tokio::spawn(Arc::clone(self).monitor_incoming(reader));
        let timeouts = tokio::spawn(Arc::clone(self).monitor_request_timeouts());
        let outgoing = tokio::spawn(Arc::clone(self).send_outgoing(receiver, writer));

        let (incoming, timeouts, outgoing) = tokio::join!(incoming, timeouts, outgoing);
        for result in [incoming, timeouts, outgoing] {
            if let Err(e) = result {
                warn!("Node task for {} failed: {}", self.address, e);
            }
        }

        self.stop();
        self.active.store(false, Ordering::SeqCst);
        info!("Disconnected from {}", self.address);
        Ok(())
    }

    /// Stops all tasks and closes the outgoing queue. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop_token.cancel();
        if self.outgoing.lock().take().is_some() {
            debug!("Stopping node for {}", self.address);
        }
    }

    pub async fn broadcast_tx(&self, tx: Transaction) -> Result<(), NodeError> {
        self.queue(P2pMessage::Tx(tx)).await
    }

    /// Transactions confirmed in a block no longer need to be requested.
    pub fn process_block(&self, txids: &[Hash]) {
        self.tracker.remove(txids);
    }

    fn connect_failed(&self, err: NodeError) -> NodeError {
        warn!("Connection to {} failed: {}", self.address, err);
        self.peers.update_score(&self.address, FAILURE_SCORE_PENALTY);
        self.active.store(false, Ordering::SeqCst);
        self.stop();
        err
    }

    fn penalize(&self) {
        self.peers.update_score(&self.address, FAILURE_SCORE_PENALTY);
    }

    fn version_message(&self) -> P2pMessage {
        P2pMessage::Version {
            version: PROTOCOL_VERSION,
            user_agent: self.config.user_agent.clone(),
            height: self.blocks.last_height(),
            timestamp: Utc::now().timestamp(),
            nonce: rand::random::<u64>(),
        }
    }

    async fn queue(&self, msg: P2pMessage) -> Result<(), NodeError> {
        let sender = self.outgoing.lock().clone().ok_or(NodeError::Inactive)?;
        tokio::select! {
            sent = sender.send(msg) => sent.map_err(|_| NodeError::Inactive),
            _ = self.stop_token.cancelled() => Err(NodeError::Inactive),
        }
    }

    /// Advances the handshake and queues whatever the current state calls for.
    async fn check(&self) -> Result<(), NodeError> {
        let mut pending = Vec::new();
        let verified = {
            let mut state = self.state.lock();
            if !state.version_received() {
                return Ok(());
            }

            if !state.handshake_complete() {
                pending.push(build_header_request(
                    state.protocol_version(),
                    self.blocks.as_ref(),
                    self.config.header_delta,
                    self.config.header_count,
                )?);
                state.begin_header_request(Instant::now());
                debug!("Requested headers from {} for verification", self.address);
            }

            if state.take_score_update() {
                self.peers.update_score(&self.address, VERIFIED_SCORE_BONUS);
            }
            if state.take_address_request() {
                pending.push(P2pMessage::GetAddr);
            }
            if state.take_mempool_request() {
                pending.push(P2pMessage::MemPool);
            }
            state.is_verified()
        };

        if verified {
            pending.extend(self.tracker.check(&self.mempool)?);
        }
        for msg in pending {
            self.queue(msg).await?;
        }
        Ok(())
    }

    async fn monitor_incoming(self: Arc<Self>, mut reader: PeerReader<OwnedReadHalf>) {
        loop {
            if let Err(e) = self.check().await {
                if !matches!(e, NodeError::Inactive) {
                    warn!("Check failed for {}: {}", self.address, e);
                }
                self.stop();
                break;
            }

            let next = tokio::select! {
                _ = self.stop_token.cancelled() => break,
                next = reader.next_message() => next,
            };

            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("Peer {} closed the connection", self.address);
                    self.stop();
                    break;
                }
                Err(e) => {
                    warn!("Failed to read from {}: {}", self.address, e);
                    self.penalize();
                    self.stop();
                    break;
                }
            };

            debug!("Received {} from {}", msg.command(), self.address);
            let replies = match handle_message(&self.handlers, &msg) {
                Ok(replies) => replies,
                Err(e) => {
                    warn!("Protocol violation by {} on {}: {}", self.address, msg.command(), e);
                    self.penalize();
                    self.stop();
                    break;
                }
            };
            for reply in replies {
                if self.queue(reply).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn monitor_request_timeouts(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop_token.cancelled() => break,
                _ = tokio::time::sleep(self.config.timeout_check_interval) => {}
            }

            let result = self.state.lock().check_timeouts(Instant::now());
            if let Err(e) = result {
                warn!("Peer {} timed out: {}", self.address, e);
                self.penalize();
                self.stop();
                break;
            }
        }
    }

    async fn send_outgoing(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<P2pMessage>,
        mut writer: PeerWriter<OwnedWriteHalf>,
    ) {
        loop {
            let msg = tokio::select! {
                _ = self.stop_token.cancelled() => break,
                msg = receiver.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            debug!("Sending {} to {}", msg.command(), self.address);
            if let Err(e) = writer.send_message(&msg).await {
                warn!("Failed to send {} to {}: {}", msg.command(), self.address, e);
                self.penalize();
                self.stop();
                break;
            }
        }

        if let Err(e) = writer.close().await {
            debug!("Closing connection to {}: {}", self.address, e);
        }
    }
}

/// Builds the `GetHeaders` used to verify the peer: the locator starts
/// `delta` blocks below the local tip and walks back up to `count` hashes.
pub fn build_header_request(
    version: u32,
    blocks: &dyn BlockRepository,
    delta: u64,
    count: usize,
) -> Result<P2pMessage, NodeError> {
    let start = blocks.last_height().saturating_sub(delta);
    let locator_hashes: Vec<Hash> = (0..=start)
        .rev()
        .take(count)
        .filter_map(|height| blocks.hash_at(height))
        .collect();

    if locator_hashes.is_empty() {
        return Err(NodeError::EmptyLocator);
    }
    Ok(P2pMessage::GetHeaders {
        version,
        locator_hashes,
        stop_hash: None,
    })
}
