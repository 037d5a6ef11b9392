// Protocol constants shared by the node and its collaborators

use bincode::config;
use once_cell::sync::Lazy;
use std::time::Duration;

/// bincode settings for everything that goes over the wire
pub static BINCODE_CONFIG: Lazy<config::Configuration> = Lazy::new(config::standard);

/// Upper bound on the memory one decoded peer message may claim
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// bincode settings for decoding untrusted input; length prefixes beyond
/// `MAX_MESSAGE_SIZE` fail instead of allocating
pub static DECODE_CONFIG: Lazy<config::Configuration<config::LittleEndian, config::Varint, config::Limit<MAX_MESSAGE_SIZE>>> =
    Lazy::new(|| config::standard().with_limit::<MAX_MESSAGE_SIZE>());

// ========== Protocol ==========
/// Protocol version advertised in our version message
pub const PROTOCOL_VERSION: u32 = 70015;

/// Peers advertising anything older are dropped during the handshake
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// Default user agent sent in the version message
pub const USER_AGENT: &str = "/spynode:0.1.0/";

/// Maximum hashes in a single inv/getdata/notfound message
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

// ========== Untrusted peers ==========
/// Header request starts this many blocks below our tip
pub const UNTRUSTED_HEADER_DELTA: u64 = 6;

/// Number of locator hashes in the verification header request
pub const UNTRUSTED_HEADER_COUNT: usize = 10;

/// Capacity of the per-node outgoing message queue
pub const OUTGOING_QUEUE_CAPACITY: usize = 100;

// ========== Reputation ==========
/// Reward once a peer's chain view is verified
pub const VERIFIED_SCORE_BONUS: i32 = 5;

/// Penalty for connection, protocol and timeout failures
pub const FAILURE_SCORE_PENALTY: i32 = -1;

// ========== Mempool ==========
/// Minimum delay between two getdata requests for the same transaction
pub const REQUEST_THROTTLE: Duration = Duration::from_secs(3);
