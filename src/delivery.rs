//! Stop-and-wait delivery engine (ARQ).
//!
//! # Sender
//!
//! ```text
//!            send ──▶ PENDING ──accept──▶ ACKED ──▶ next fragment
//!              ▲         │
//!              │         ├──reject──▶ REJECTED ──▶ resend, fresh corruption draw
//!              │         │
//!              └─────────┴──timeout─▶ TIMED_OUT ─▶ resend identical bytes (once)
//!                                          │
//!                                  2nd timeout in a row
//!                                          ▼
//!                                   PeerUnresponsive
//! ```
//!
//! Rejects are retried without limit: each resend re-rolls the injected
//! corruption, so a transfer at a high error rate still finishes.  After the
//! last fragment a transfer-end frame is sent and its echo awaited once; a
//! missing echo is logged, not fatal.
//!
//! # Receiver
//!
//! [`DeliveryEngine::respond`] runs a data frame through the
//! [`Reassembler`] and answers accept or reject.  Duplicates are answered
//! per [`DuplicatePolicy`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout_at, Instant};

use crate::config::{DuplicatePolicy, TransferJob};
use crate::packet::{Flag, Frame};
use crate::receiver::{AcceptResult, Reassembler};
use crate::sender::{Fragmenter, InFlight};
use crate::simulator::ErrorInjector;
use crate::socket::{Socket, SocketError};

/// Consecutive timeouts on one fragment that abort the transfer.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 2;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("peer unresponsive: fragment {sequence} unanswered after {attempts} transmissions")]
    PeerUnresponsive { sequence: u16, attempts: u32 },
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// How the wait for one reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Accepted,
    Rejected,
    TimedOut,
}

/// Counters for one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    /// Data fragments delivered (the name announcement is not counted).
    pub fragments: usize,
    /// Payload bytes delivered.
    pub bytes: usize,
    /// Every datagram sent for fragments, first sends and resends alike.
    pub transmissions: u32,
    /// Resends caused by a reject.
    pub rejects: u32,
    /// Reply deadlines that expired.
    pub timeouts: u32,
    /// Whether the transfer-end frame was echoed.
    pub end_acknowledged: bool,
}

/// Binds the ARQ rules to one socket and one peer.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryEngine<'a> {
    socket: &'a Socket,
    peer: SocketAddr,
    ack_timeout: Duration,
}

impl<'a> DeliveryEngine<'a> {
    pub fn new(socket: &'a Socket, peer: SocketAddr, ack_timeout: Duration) -> Self {
        Self {
            socket,
            peer,
            ack_timeout,
        }
    }

    // -----------------------------------------------------------------------
    // Sender side
    // -----------------------------------------------------------------------

    /// Deliver every fragment of `job`, then signal transfer-end.
    pub async fn send_job(
        &self,
        job: &TransferJob,
        injector: &mut ErrorInjector,
    ) -> Result<TransferReport, DeliveryError> {
        let mut report = TransferReport::default();
        log::info!(
            "[arq] sending {} B in {} fragment(s) of ≤{} B, error rate {}",
            job.payload().len(),
            job.fragment_count(),
            job.fragment_size(),
            job.error_rate()
        );

        for frame in Fragmenter::new(job) {
            let len = frame.payload.len();
            let is_data = frame.sequence != 0;
            self.send_fragment(frame, injector, &mut report).await?;
            if is_data {
                report.fragments += 1;
                report.bytes += len;
            }
        }

        self.socket
            .send_to(&Frame::control(Flag::TransferEnd), self.peer)
            .await?;
        report.end_acknowledged = self.await_end().await?;
        if !report.end_acknowledged {
            log::warn!("[arq] transfer-end not echoed; data was delivered");
        }
        log::info!("[arq] transfer complete: {report:?}");
        Ok(report)
    }

    /// Deliver one fragment under the stop-and-wait rules.
    pub async fn send_fragment(
        &self,
        frame: Frame,
        injector: &mut ErrorInjector,
        report: &mut TransferReport,
    ) -> Result<(), DeliveryError> {
        let mut entry = InFlight::new(frame, injector);
        loop {
            self.socket.send_raw(&entry.wire, self.peer).await?;
            report.transmissions += 1;
            log::debug!(
                "[arq] → DATA seq={} len={} tx={}",
                entry.sequence(),
                entry.frame.payload.len(),
                entry.tx_count
            );

            match self.await_reply(entry.sequence()).await? {
                Reply::Accepted => {
                    log::debug!("[arq] ← ACCEPT seq={}", entry.sequence());
                    return Ok(());
                }
                Reply::Rejected => {
                    log::debug!("[arq] ← REJECT seq={}; resending", entry.sequence());
                    report.rejects += 1;
                    entry.on_reject(injector);
                }
                Reply::TimedOut => {
                    report.timeouts += 1;
                    if !entry.on_timeout(MAX_CONSECUTIVE_TIMEOUTS) {
                        log::warn!(
                            "[arq] seq={} unanswered after {} transmissions",
                            entry.sequence(),
                            entry.tx_count
                        );
                        return Err(DeliveryError::PeerUnresponsive {
                            sequence: entry.sequence(),
                            attempts: entry.tx_count,
                        });
                    }
                    log::warn!("[arq] seq={} timed out; resending once", entry.sequence());
                }
            }
        }
    }

    /// Wait for the accept/reject that answers `sequence`.
    ///
    /// Frames from other addresses, replies to other sequences and any other
    /// flag are skipped without extending the deadline.
    async fn await_reply(&self, sequence: u16) -> Result<Reply, DeliveryError> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let (frame, addr) = match timeout_at(deadline, self.socket.recv_from()).await {
                Err(_elapsed) => return Ok(Reply::TimedOut),
                Ok(Ok(v)) => v,
                Ok(Err(e)) if e.is_transient() => {
                    log::debug!("[arq] dropped datagram: {e}");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            if addr != self.peer {
                continue;
            }
            match frame.flag {
                Flag::Accept if frame.sequence == sequence => return Ok(Reply::Accepted),
                Flag::Reject if frame.sequence == sequence => return Ok(Reply::Rejected),
                other => log::debug!("[arq] ignoring {other} seq={} while waiting", frame.sequence),
            }
        }
    }

    /// Wait once for the transfer-end echo.  `Ok(false)` on timeout.
    async fn await_end(&self) -> Result<bool, DeliveryError> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            match timeout_at(deadline, self.socket.recv_from()).await {
                Err(_elapsed) => return Ok(false),
                Ok(Ok((frame, addr))) if addr == self.peer && frame.flag == Flag::TransferEnd => {
                    return Ok(true)
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_transient() => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Receiver side
    // -----------------------------------------------------------------------

    /// Run one inbound data frame through `reassembler` and send the reply
    /// it calls for.
    pub async fn respond(
        &self,
        frame: &Frame,
        reassembler: &mut Reassembler,
        policy: DuplicatePolicy,
    ) -> Result<AcceptResult, DeliveryError> {
        let result = reassembler.accept(frame.sequence, &frame.payload, frame.checksum_valid());

        let reply = match (result.reply(), policy) {
            (Some(flag), _) => Some(flag),
            (None, DuplicatePolicy::Reacknowledge) => Some(Flag::Accept),
            (None, DuplicatePolicy::Ignore) => None,
        };

        match result {
            AcceptResult::Accepted => log::info!(
                "Packet {} accepted | Data size: {}",
                frame.sequence,
                frame.payload.len()
            ),
            AcceptResult::NameDeclared => log::info!(
                "File name: {}",
                String::from_utf8_lossy(&frame.payload)
            ),
            AcceptResult::Rejected => log::info!("Packet {} discarded", frame.sequence),
            AcceptResult::Duplicate => log::debug!("[arq] duplicate seq={}", frame.sequence),
        }

        if let Some(flag) = reply {
            self.socket
                .send_to(&Frame::new(flag, frame.sequence, Vec::new()), self.peer)
                .await?;
        }
        Ok(result)
    }
}
