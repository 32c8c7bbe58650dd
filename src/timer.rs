//! Timeout policy for every blocking wait in the protocol.
//!
//! The deadlines differ by call site: a peer waiting to be contacted is far
//! more patient than a sender waiting for one acknowledgement.  Each one is
//! a named field of [`Timeouts`] so callers (and tests) can shorten them
//! without touching protocol code.

use std::time::Duration;

/// How long the responder waits for the first connect frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a receiver tolerates total silence before giving up on the peer.
pub const RECEIVER_IDLE_TIMEOUT: Duration = Duration::from_secs(40);
/// How long the sender waits for an accept/reject after each frame.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);
/// How long an idle role-holder listens for an instruction from its peer.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Heartbeat deadline unit; the n-th consecutive failure waits `(n + 1)` units.
pub const HEARTBEAT_BASE: Duration = Duration::from_secs(5);
/// Consecutive heartbeat failures that end the session.
pub const HEARTBEAT_MAX_FAILURES: u32 = 3;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub receiver_idle: Duration,
    pub ack: Duration,
    pub listen: Duration,
    pub heartbeat_base: Duration,
    pub heartbeat_max_failures: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE_TIMEOUT,
            receiver_idle: RECEIVER_IDLE_TIMEOUT,
            ack: ACK_TIMEOUT,
            listen: LISTEN_TIMEOUT,
            heartbeat_base: HEARTBEAT_BASE,
            heartbeat_max_failures: HEARTBEAT_MAX_FAILURES,
        }
    }
}

impl Timeouts {
    /// Every wait scaled by the same factor; handy for loopback tests.
    pub fn scaled(factor: f64) -> Self {
        let d = Self::default();
        Self {
            handshake: d.handshake.mul_f64(factor),
            receiver_idle: d.receiver_idle.mul_f64(factor),
            ack: d.ack.mul_f64(factor),
            listen: d.listen.mul_f64(factor),
            heartbeat_base: d.heartbeat_base.mul_f64(factor),
            heartbeat_max_failures: d.heartbeat_max_failures,
        }
    }
}
