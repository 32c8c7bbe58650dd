//! Liveness monitor: heartbeats while the role-holder sits idle.
//!
//! The monitor runs as its own tokio task so the session loop can block on
//! something else (the local console, typically).  It is started and stopped
//! explicitly through a [`Heartbeat`] handle; nothing polls a shared flag.
//!
//! Each round sends one heartbeat and waits for any frame from the peer:
//!
//! ```text
//!   deadline = base × (failures + 1)
//!   reply    → failures = 0, sleep(deadline), next round
//!   timeout  → failures += 1, next round immediately
//!   failures == max → PeerLost
//! ```
//!
//! While it owns the socket the monitor is the only reader, so it also
//! catches switch/terminate frames the peer sends in the meantime and
//! forwards them to the session through an inbox channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::packet::{Flag, Frame};
use crate::socket::Socket;
use crate::timer::Timeouts;

// ---------------------------------------------------------------------------
// Failure accounting
// ---------------------------------------------------------------------------

/// What a missed heartbeat means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Try again straight away with a longer deadline.
    Retry,
    /// Too many misses in a row; give up on the peer.
    PeerLost,
}

/// Consecutive-failure counter behind the heartbeat schedule.
#[derive(Debug, Clone)]
pub struct Liveness {
    failures: u32,
    max_failures: u32,
    base: Duration,
}

impl Liveness {
    pub fn new(timeouts: &Timeouts) -> Self {
        Self {
            failures: 0,
            max_failures: timeouts.heartbeat_max_failures.max(1),
            base: timeouts.heartbeat_base,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reply deadline for the next heartbeat.
    pub fn deadline(&self) -> Duration {
        self.base * (self.failures + 1)
    }

    pub fn on_reply(&mut self) {
        self.failures = 0;
    }

    pub fn on_timeout(&mut self) -> Verdict {
        self.failures += 1;
        if self.failures >= self.max_failures {
            Verdict::PeerLost
        } else {
            Verdict::Retry
        }
    }
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// How a heartbeat task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// Stopped on request.
    Stopped,
    /// The peer missed too many heartbeats.
    PeerLost,
    /// The socket failed; the task ended without retrying.
    SocketFailed,
}

/// Cancellation handle for a running heartbeat task.
///
/// Dropping the handle also stops the task (its stop channel closes).
#[derive(Debug)]
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<LivenessOutcome>,
    outcome: Option<LivenessOutcome>,
}

impl Heartbeat {
    /// Start heartbeating `peer` over `socket`.
    ///
    /// Switch and terminate frames received while running are pushed into
    /// `inbox`.
    pub fn spawn(
        socket: Arc<Socket>,
        peer: SocketAddr,
        timeouts: Timeouts,
        inbox: mpsc::UnboundedSender<Flag>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(socket, peer, timeouts, inbox, stop_rx));
        log::debug!("[keepalive] started");
        Self {
            stop: Some(stop_tx),
            task,
            outcome: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.task.is_finished()
    }

    /// Wait for the task to end on its own.  Cancel-safe.
    pub async fn finished(&mut self) -> LivenessOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let outcome = (&mut self.task)
            .await
            .unwrap_or(LivenessOutcome::SocketFailed);
        self.outcome = Some(outcome);
        outcome
    }

    /// Ask the task to stop without waiting for it.  Idempotent.
    pub fn request_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// `true` once a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_none()
    }

    /// Stop the task and wait until it no longer touches the socket.
    ///
    /// Returns [`LivenessOutcome::PeerLost`] if the peer was declared lost
    /// before the stop request landed.
    pub async fn stop(mut self) -> LivenessOutcome {
        self.request_stop();
        let outcome = self.finished().await;
        log::debug!("[keepalive] stopped: {outcome:?}");
        outcome
    }
}

// ---------------------------------------------------------------------------
// Task body
// ---------------------------------------------------------------------------

async fn run(
    socket: Arc<Socket>,
    peer: SocketAddr,
    timeouts: Timeouts,
    inbox: mpsc::UnboundedSender<Flag>,
    mut stop: oneshot::Receiver<()>,
) -> LivenessOutcome {
    let mut liveness = Liveness::new(&timeouts);

    loop {
        let wait = liveness.deadline();
        if let Err(e) = socket.send_to(&Frame::control(Flag::Heartbeat), peer).await {
            log::warn!("[keepalive] send failed: {e}");
            return LivenessOutcome::SocketFailed;
        }

        let deadline = Instant::now() + wait;
        let answered = loop {
            tokio::select! {
                _ = &mut stop => return LivenessOutcome::Stopped,
                res = timeout_at(deadline, socket.recv_from()) => match res {
                    Err(_elapsed) => break false,
                    Ok(Ok((frame, addr))) if addr == peer => {
                        if matches!(frame.flag, Flag::SwitchRole | Flag::Terminate) {
                            let _ = inbox.send(frame.flag);
                        }
                        break true;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) if e.is_transient() => {}
                    Ok(Err(e)) => {
                        log::warn!("[keepalive] receive failed: {e}");
                        return LivenessOutcome::SocketFailed;
                    }
                },
            }
        };

        if answered {
            liveness.on_reply();
            log::debug!("[keepalive] peer alive; next heartbeat in {wait:?}");
            tokio::select! {
                _ = &mut stop => return LivenessOutcome::Stopped,
                _ = tokio::time::sleep(wait) => {}
            }
        } else {
            match liveness.on_timeout() {
                Verdict::Retry => log::warn!(
                    "[keepalive] peer did not respond ({}/{})",
                    liveness.failures(),
                    timeouts.heartbeat_max_failures
                ),
                Verdict::PeerLost => {
                    log::warn!(
                        "[keepalive] peer did not respond {} times; giving up",
                        liveness.failures()
                    );
                    return LivenessOutcome::PeerLost;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_misses_lose_the_peer() {
        let mut l = Liveness::new(&Timeouts::default());
        assert_eq!(l.on_timeout(), Verdict::Retry);
        assert_eq!(l.on_timeout(), Verdict::Retry);
        assert_eq!(l.on_timeout(), Verdict::PeerLost);
    }

    #[test]
    fn reply_resets_failures() {
        let mut l = Liveness::new(&Timeouts::default());
        l.on_timeout();
        l.on_timeout();
        assert_eq!(l.failures(), 2);
        l.on_reply();
        assert_eq!(l.failures(), 0);
        assert_eq!(l.on_timeout(), Verdict::Retry);
    }

    #[test]
    fn deadline_escalates_with_failures() {
        let mut l = Liveness::new(&Timeouts::default());
        assert_eq!(l.deadline(), Duration::from_secs(5));
        l.on_timeout();
        assert_eq!(l.deadline(), Duration::from_secs(10));
        l.on_timeout();
        assert_eq!(l.deadline(), Duration::from_secs(15));
        l.on_reply();
        assert_eq!(l.deadline(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn interrupted_stop_can_be_finished_later() {
        let socket = Arc::new(Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let silent = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (inbox, _inbox_rx) = mpsc::unbounded_channel();
        let mut hb = Heartbeat::spawn(socket, silent.local_addr, Timeouts::default(), inbox);
        assert!(!hb.is_stopping());

        hb.request_stop();
        // Abandon the first wait before the task has had a chance to run.
        let _ = tokio::time::timeout(Duration::ZERO, hb.finished()).await;
        hb.request_stop();
        assert!(hb.is_stopping());
        assert_eq!(hb.finished().await, LivenessOutcome::Stopped);
        assert!(hb.is_finished());
    }
}
