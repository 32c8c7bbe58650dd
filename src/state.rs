//! Session finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Peer`] can occupy
//! and the role it holds.  Transitions live in [`crate::connection`].
//!
//! ```text
//!  HANDSHAKE ──▶ IDLE(R) ──send──▶ TRANSFERRING(R) ──done──▶ IDLE(R)
//!                  │  ▲
//!           switch │  └──────────────── SWITCHING ◀─┐
//!                  ▼                                │
//!               IDLE(¬R) ───────────────────────────┘
//!                  │
//!        terminate / peer lost
//!                  ▼
//!             TERMINATED
//! ```

/// Which direction this peer may originate data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Role-holder: may start transfers, switch roles, or terminate.
    Sender,
    /// Answers data frames and heartbeats; can request a switch.
    Receiver,
}

impl Role {
    pub fn flipped(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// All possible states of the session FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Connect frame sent or awaited; no role yet.
    #[default]
    Handshake,
    /// No transfer in progress.
    Idle,
    /// Exactly one transfer is being sent or received.
    Transferring,
    /// Role flip in progress.
    Switching,
    /// Socket closed; nothing more is sent or processed.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse liveness as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    /// A transfer is running; no heartbeat needed.
    Active,
    /// Idle; the heartbeat (if this side runs one) has not given up.
    Idle,
    /// Closed, or the heartbeat declared the peer lost.
    Terminated,
}
