//! Handshake progress for a single untrusted connection.
//!
//! Every one-shot step is a transition method that reports whether it fired,
//! so re-running the node's state check can never repeat an action.

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("version not received within {0:?} of connecting")]
    Version(Duration),
    #[error("headers not verified within {0:?} of requesting them")]
    Verification(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    pub version: Duration,
    pub verification: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            version: Duration::from_secs(15),
            verification: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionState {
    timeouts: HandshakeTimeouts,
    connected_at: Option<Instant>,

    version_received: bool,
    protocol_version: u32,
    peer_user_agent: String,
    peer_height: u64,

    handshake_complete: bool,
    headers_requested_at: Option<Instant>,
    verified: bool,

    score_updated: bool,
    addresses_requested: bool,
    mempool_requested: bool,
}

impl ConnectionState {
    pub fn new(timeouts: HandshakeTimeouts) -> Self {
        Self {
            timeouts,
            connected_at: None,
            version_received: false,
            protocol_version: 0,
            peer_user_agent: String::new(),
            peer_height: 0,
            handshake_complete: false,
            headers_requested_at: None,
            verified: false,
            score_updated: false,
            addresses_requested: false,
            mempool_requested: false,
        }
    }

    pub fn mark_connected(&mut self, now: Instant) {
        self.connected_at = Some(now);
    }

    /// Records the peer's version message. Returns false if one was already received.
    pub fn mark_version_received(&mut self, protocol_version: u32, user_agent: &str, height: u64) -> bool {
        if self.version_received {
            return false;
        }
        self.version_received = true;
        self.protocol_version = protocol_version;
        self.peer_user_agent = user_agent.to_string();
        self.peer_height = height;
        true
    }

    /// Marks the verification header request as sent, completing the handshake.
    pub fn begin_header_request(&mut self, now: Instant) -> bool {
        if !self.version_received || self.handshake_complete {
            return false;
        }
        self.headers_requested_at = Some(now);
        self.handshake_complete = true;
        true
    }

    pub fn mark_verified(&mut self) -> bool {
        if self.verified {
            return false;
        }
        self.verified = true;
        true
    }

    pub fn take_score_update(&mut self) -> bool {
        take_once(self.verified, &mut self.score_updated)
    }

    pub fn take_address_request(&mut self) -> bool {
        take_once(self.verified, &mut self.addresses_requested)
    }

    pub fn take_mempool_request(&mut self) -> bool {
        take_once(self.verified, &mut self.mempool_requested)
    }

    pub fn check_timeouts(&self, now: Instant) -> Result<(), TimeoutError> {
        if !self.version_received {
            if let Some(connected_at) = self.connected_at {
                if now.saturating_duration_since(connected_at) > self.timeouts.version {
                    return Err(TimeoutError::Version(self.timeouts.version));
                }
            }
        }

        if !self.verified {
            if let Some(requested_at) = self.headers_requested_at {
                if now.saturating_duration_since(requested_at) > self.timeouts.verification {
                    return Err(TimeoutError::Verification(self.timeouts.verification));
                }
            }
        }

        Ok(())
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn version_received(&self) -> bool {
        self.version_received
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn peer_user_agent(&self) -> &str {
        &self.peer_user_agent
    }

    pub fn peer_height(&self) -> u64 {
        self.peer_height
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn headers_requested_at(&self) -> Option<Instant> {
        self.headers_requested_at
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }
}

fn take_once(allowed: bool, done: &mut bool) -> bool {
    if !allowed || *done {
        return false;
    }
    *done = true;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConnectionState {
        ConnectionState::new(HandshakeTimeouts {
            version: Duration::from_secs(15),
            verification: Duration::from_secs(20),
        })
    }

    #[test]
    fn version_is_recorded_once() {
        let mut st = state();
        assert!(st.mark_version_received(70015, "/peer:1/", 700_000));
        assert!(!st.mark_version_received(70016, "/other/", 1));
        assert_eq!(st.protocol_version(), 70015);
        assert_eq!(st.peer_user_agent(), "/peer:1/");
        assert_eq!(st.peer_height(), 700_000);
    }

    #[test]
    fn header_request_waits_for_version_and_fires_once() {
        let mut st = state();
        let now = Instant::now();
        assert!(!st.begin_header_request(now));
        assert!(!st.handshake_complete());

        st.mark_version_received(70015, "", 0);
        assert!(st.begin_header_request(now));
        assert!(st.handshake_complete());
        assert_eq!(st.headers_requested_at(), Some(now));
        assert!(!st.begin_header_request(now + Duration::from_secs(1)));
        assert_eq!(st.headers_requested_at(), Some(now));
    }

    #[test]
    fn post_verification_steps_fire_once_after_verify() {
        let mut st = state();
        assert!(!st.take_score_update());
        assert!(!st.take_address_request());
        assert!(!st.take_mempool_request());

        assert!(st.mark_verified());
        assert!(!st.mark_verified());

        assert!(st.take_score_update());
        assert!(st.take_address_request());
        assert!(st.take_mempool_request());
        assert!(!st.take_score_update());
        assert!(!st.take_address_request());
        assert!(!st.take_mempool_request());
    }

    #[test]
    fn version_timeout() {
        let mut st = state();
        let start = Instant::now();
        // not connected yet, nothing to time out
        assert_eq!(st.check_timeouts(start + Duration::from_secs(60)), Ok(()));

        st.mark_connected(start);
        assert_eq!(st.check_timeouts(start + Duration::from_secs(15)), Ok(()));
        assert_eq!(
            st.check_timeouts(start + Duration::from_secs(16)),
            Err(TimeoutError::Version(Duration::from_secs(15)))
        );

        st.mark_version_received(70015, "", 0);
        assert_eq!(st.check_timeouts(start + Duration::from_secs(16)), Ok(()));
    }

    #[test]
    fn verification_timeout() {
        let mut st = state();
        let start = Instant::now();
        st.mark_connected(start);
        st.mark_version_received(70015, "", 0);
        st.begin_header_request(start);

        assert_eq!(st.check_timeouts(start + Duration::from_secs(20)), Ok(()));
        assert_eq!(
            st.check_timeouts(start + Duration::from_secs(21)),
            Err(TimeoutError::Verification(Duration::from_secs(20)))
        );

        st.mark_verified();
        assert_eq!(st.check_timeouts(start + Duration::from_secs(60)), Ok(()));
    }
}
