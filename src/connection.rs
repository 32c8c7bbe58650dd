//! Per-session lifecycle manager.
//!
//! A [`Peer`] owns the complete state for one conversation with one remote
//! endpoint.  Its responsibilities are:
//! - The connect handshake (active via [`Peer::connect`], passive via
//!   [`Peer::accept`]).
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Running transfers through [`crate::delivery`] in either direction.
//! - Starting and stopping the [`crate::keepalive`] heartbeat around idle
//!   periods, so the heartbeat and a transfer never read the socket at once.
//! - Role switches and termination, in both directions.
//!
//! Both ends of a session are the same type; the [`Role`] decides which
//! operations are allowed.  A role switch is a state transition, not a
//! hand-off to a different code path.
//!
//! # Typical use
//!
//! ```ignore
//! // Initiator: becomes the sender.
//! let mut peer = Peer::connect(socket, server_addr, SessionConfig::default(), sink).await?;
//! peer.send(&TransferJob::text("HELLOX", 4, 0.1)?).await?;
//! peer.switch_role().await?;
//!
//! // Responder: becomes the receiver.
//! let mut peer = Peer::accept(socket, SessionConfig::default(), sink).await?;
//! match peer.serve(&mut console_rx).await? {
//!     ServeOutcome::RoleSwitched => { /* now a sender */ }
//!     ServeOutcome::Terminated => {}
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::{ConfigError, SessionConfig, TransferJob};
use crate::delivery::{DeliveryEngine, DeliveryError, TransferReport};
use crate::keepalive::{Heartbeat, LivenessOutcome};
use crate::packet::{Flag, Frame};
use crate::receiver::{Completed, Reassembler};
use crate::simulator::ErrorInjector;
use crate::sink::StorageSink;
use crate::socket::{Socket, SocketError};
use crate::state::{LivenessStatus, Role, SessionState};

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Session-level failures.  `HandshakeFailed`, `PeerUnresponsive` and
/// `Socket` leave the session terminated.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: no connect reply within the handshake timeout")]
    HandshakeFailed,
    #[error("peer unresponsive; session closed")]
    PeerUnresponsive,
    #[error("operation requires the {expected} role, but this peer is the {actual}")]
    WrongRole { expected: Role, actual: Role },
    #[error("session already terminated")]
    Terminated,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage sink failed: {0}")]
    Storage(#[from] std::io::Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Instruction from the local console to a serving receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the sender to hand over the role.
    SwitchRole,
    /// End the session.
    Terminate,
}

/// Instruction from the remote peer, as seen by the role-holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// The peer asked for the role; this side is now the receiver.
    SwitchRole,
    /// The peer ended the session.
    Terminate,
    /// Nothing arrived before the listen deadline.
    Nothing,
}

/// Why [`Peer::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// This side now holds the sender role.
    RoleSwitched,
    /// The session is over.
    Terminated,
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// One end of a session.
pub struct Peer<S: StorageSink> {
    /// `None` once the session is closed.
    socket: Option<Arc<Socket>>,
    peer: SocketAddr,
    role: Role,
    state: SessionState,
    config: SessionConfig,
    sink: S,
    injector: ErrorInjector,
    reassembler: Reassembler,
    heartbeat: Option<Heartbeat>,
    /// Switch/terminate frames caught by the heartbeat task.
    inbox_tx: mpsc::UnboundedSender<Flag>,
    inbox_rx: mpsc::UnboundedReceiver<Flag>,
    /// Instruction taken from the inbox but not yet carried out.
    pending: Option<Flag>,
}

impl<S: StorageSink> Peer<S> {
    fn new(socket: Socket, peer: SocketAddr, role: Role, config: SessionConfig, sink: S) -> Self {
        let injector = match config.seed {
            Some(seed) => ErrorInjector::seeded(0.0, seed),
            None => ErrorInjector::new(0.0),
        };
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            socket: Some(Arc::new(socket)),
            peer,
            role,
            state: SessionState::Handshake,
            config,
            sink,
            injector,
            reassembler: Reassembler::new(),
            heartbeat: None,
            inbox_tx,
            inbox_rx,
            pending: None,
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Active open: contact `server` and become the sender.
    pub async fn connect(
        socket: Socket,
        server: SocketAddr,
        config: SessionConfig,
        sink: S,
    ) -> Result<Self, SessionError> {
        let wait = config.timeouts.handshake;
        let mut this = Self::new(socket, server, Role::Sender, config, sink);
        let socket = this.socket()?;

        socket.send_to(&Frame::control(Flag::Connect), server).await?;
        log::debug!("[session] → CONNECT {server}");

        match recv_matching(&socket, Some(server), &[Flag::Connect], wait).await? {
            Some(_) => {
                log::info!("Established connection with {server}");
                this.enter_idle();
                Ok(this)
            }
            None => {
                log::warn!("[session] {server} did not answer the handshake");
                this.close().await;
                Err(SessionError::HandshakeFailed)
            }
        }
    }

    /// Passive open: wait for a connect frame and become the receiver.
    pub async fn accept(
        socket: Socket,
        config: SessionConfig,
        sink: S,
    ) -> Result<Self, SessionError> {
        let wait = config.timeouts.handshake;
        log::info!("Listening on {}", socket.local_addr);

        let Some((_, client)) = recv_matching(&socket, None, &[Flag::Connect], wait).await? else {
            log::warn!("[session] nobody connected within {wait:?}");
            return Err(SessionError::HandshakeFailed);
        };
        socket.send_to(&Frame::control(Flag::Connect), client).await?;
        log::info!("Client {client} connected");

        let mut this = Self::new(socket, client, Role::Receiver, config, sink);
        this.enter_idle();
        Ok(this)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|s| s.local_addr)
    }

    /// `true` while a heartbeat task is running for this session.
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .as_ref()
            .is_some_and(|hb| !hb.is_finished() && !hb.is_stopping())
    }

    pub fn liveness(&self) -> LivenessStatus {
        match self.state {
            SessionState::Terminated => LivenessStatus::Terminated,
            _ if self.heartbeat.as_ref().is_some_and(Heartbeat::is_finished) => {
                LivenessStatus::Terminated
            }
            SessionState::Transferring => LivenessStatus::Active,
            _ => LivenessStatus::Idle,
        }
    }

    // -----------------------------------------------------------------------
    // Sender role
    // -----------------------------------------------------------------------

    /// Deliver one message or file.  Returns to idle with the same role.
    ///
    /// If the peer stops answering the session is closed and
    /// [`SessionError::PeerUnresponsive`] is returned.
    pub async fn send(&mut self, job: &TransferJob) -> Result<TransferReport, SessionError> {
        self.require(Role::Sender)?;
        self.pause_heartbeat().await?;
        let socket = self.socket()?;

        self.state = SessionState::Transferring;
        self.injector.set_error_rate(job.error_rate());
        let engine = DeliveryEngine::new(&socket, self.peer, self.config.timeouts.ack);

        match engine.send_job(job, &mut self.injector).await {
            Ok(report) => {
                self.enter_idle();
                Ok(report)
            }
            Err(DeliveryError::PeerUnresponsive { sequence, attempts }) => {
                log::warn!(
                    "[session] fragment {sequence} unanswered after {attempts} transmissions; closing"
                );
                self.close().await;
                Err(SessionError::PeerUnresponsive)
            }
            Err(DeliveryError::Socket(e)) => {
                self.close().await;
                Err(e.into())
            }
        }
    }

    /// Hand the sender role to the peer; this side becomes the receiver.
    pub async fn switch_role(&mut self) -> Result<(), SessionError> {
        self.require(Role::Sender)?;
        self.pause_heartbeat().await?;
        let socket = self.socket()?;

        self.state = SessionState::Switching;
        socket.send_to(&Frame::control(Flag::SwitchRole), self.peer).await?;
        self.flip_role();
        Ok(())
    }

    /// Wait up to the listen timeout for a switch or terminate from the
    /// peer.  On expiry the heartbeat resumes and [`Instruction::Nothing`]
    /// is returned.
    pub async fn listen(&mut self) -> Result<Instruction, SessionError> {
        self.require(Role::Sender)?;
        self.pause_heartbeat().await?;

        let queued = self.pending.take().or_else(|| self.inbox_rx.try_recv().ok());
        let flag = match queued {
            Some(flag) => Some(flag),
            None => {
                let socket = self.socket()?;
                let wanted = [Flag::SwitchRole, Flag::Terminate];
                recv_matching(&socket, Some(self.peer), &wanted, self.config.timeouts.listen)
                    .await?
                    .map(|(frame, _)| frame.flag)
            }
        };

        match flag {
            Some(flag) => self.obey(flag).await,
            None => {
                log::info!("No task from peer");
                self.enter_idle();
                Ok(Instruction::Nothing)
            }
        }
    }

    /// Stay idle with the heartbeat running until the peer sends an
    /// instruction or stops answering.
    ///
    /// Cancel-safe: an instruction that already arrived is kept and carried
    /// out by the next call to this method or [`Peer::listen`].
    pub async fn wait_for_peer(&mut self) -> Result<Instruction, SessionError> {
        self.require(Role::Sender)?;

        if self.pending.is_none() {
            if self.heartbeat.as_ref().is_some_and(Heartbeat::is_stopping) {
                // An earlier call was dropped while pausing.
                self.pause_heartbeat().await?;
            }
            self.enter_idle();

            let outcome = match self.heartbeat.as_mut() {
                Some(hb) => {
                    tokio::select! {
                        flag = self.inbox_rx.recv() => Ok(flag),
                        outcome = hb.finished() => Err(outcome),
                    }
                }
                None => return Err(SessionError::Terminated),
            };

            match outcome {
                Ok(Some(flag)) => self.pending = Some(flag),
                // The sender half lives in `self`, so the inbox cannot close.
                Ok(None) => return Err(SessionError::Terminated),
                Err(LivenessOutcome::Stopped) => return Ok(Instruction::Nothing),
                Err(_) => {
                    self.close().await;
                    return Err(SessionError::PeerUnresponsive);
                }
            }
        }

        self.pause_heartbeat().await?;
        let Some(flag) = self.pending else {
            return Ok(Instruction::Nothing);
        };
        let instruction = self.obey(flag).await;
        self.pending = None;
        instruction
    }

    /// Announce termination and close the socket.  Allowed in either role.
    pub async fn terminate(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        if let Some(hb) = self.heartbeat.take() {
            hb.stop().await;
        }
        let socket = self.socket()?;
        let sent = socket.send_to(&Frame::control(Flag::Terminate), self.peer).await;
        drop(socket);
        self.close().await;
        log::info!("Connection terminated");
        sent.map_err(SessionError::from)
    }

    // -----------------------------------------------------------------------
    // Receiver role
    // -----------------------------------------------------------------------

    /// Receive transfers until the role switches or the session ends.
    ///
    /// `console` carries local instructions; they are only acted on between
    /// transfers.  A closed console is simply ignored from then on.  If the
    /// sink fails, the transfer-end is still acknowledged and the error is
    /// returned with the session left idle and usable.
    pub async fn serve(
        &mut self,
        console: &mut mpsc::Receiver<Command>,
    ) -> Result<ServeOutcome, SessionError> {
        self.require(Role::Receiver)?;
        let socket = self.socket()?;
        let engine = DeliveryEngine::new(&socket, self.peer, self.config.timeouts.ack);
        let idle_timeout = self.config.timeouts.receiver_idle;
        let mut console_open = true;

        loop {
            let mid_transfer = self.reassembler.in_progress();
            tokio::select! {
                cmd = console.recv(), if console_open && !mid_transfer => match cmd {
                    None => console_open = false,
                    Some(Command::SwitchRole) => {
                        // The role flips when the sender echoes the switch.
                        socket.send_to(&Frame::control(Flag::SwitchRole), self.peer).await?;
                        log::info!("[session] switch requested");
                    }
                    Some(Command::Terminate) => {
                        drop(socket);
                        self.terminate().await?;
                        return Ok(ServeOutcome::Terminated);
                    }
                },
                res = timeout(idle_timeout, socket.recv_from()) => {
                    let (frame, addr) = match res {
                        Err(_elapsed) => {
                            log::warn!("Client not responding");
                            drop(socket);
                            self.close().await;
                            return Err(SessionError::PeerUnresponsive);
                        }
                        Ok(Ok(v)) => v,
                        Ok(Err(e)) if e.is_transient() => {
                            log::debug!("[session] dropped datagram: {e}");
                            continue;
                        }
                        Ok(Err(e)) => {
                            drop(socket);
                            self.close().await;
                            return Err(e.into());
                        }
                    };
                    if addr != self.peer {
                        log::debug!("[session] ignoring {} from {addr}", frame.flag);
                        continue;
                    }

                    match frame.flag {
                        Flag::Connect => {
                            socket.send_to(&Frame::control(Flag::Connect), addr).await?;
                            log::info!("Client {addr} connected");
                        }
                        Flag::Heartbeat => {
                            socket.send_to(&Frame::control(Flag::Heartbeat), addr).await?;
                            log::debug!("[session] ← HEARTBEAT; echoed");
                        }
                        Flag::Data => {
                            self.state = SessionState::Transferring;
                            if let Err(e) = engine
                                .respond(&frame, &mut self.reassembler, self.config.duplicate_policy)
                                .await
                            {
                                drop(socket);
                                self.close().await;
                                return Err(match e {
                                    DeliveryError::Socket(e) => e.into(),
                                    DeliveryError::PeerUnresponsive { .. } => {
                                        SessionError::PeerUnresponsive
                                    }
                                });
                            }
                        }
                        Flag::TransferEnd => {
                            let completed = self.reassembler.finish();
                            let delivered = self.deliver(completed);
                            socket.send_to(&Frame::control(Flag::TransferEnd), addr).await?;
                            self.state = SessionState::Idle;
                            delivered?;
                        }
                        Flag::SwitchRole => {
                            drop(socket);
                            self.flip_role();
                            return Ok(ServeOutcome::RoleSwitched);
                        }
                        Flag::Terminate => {
                            drop(socket);
                            self.close().await;
                            log::info!("Peer terminated the session");
                            return Ok(ServeOutcome::Terminated);
                        }
                        Flag::Accept | Flag::Reject => {
                            log::debug!("[session] stray {} seq={}", frame.flag, frame.sequence);
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn socket(&self) -> Result<Arc<Socket>, SessionError> {
        self.socket.clone().ok_or(SessionError::Terminated)
    }

    fn require(&self, expected: Role) -> Result<(), SessionError> {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        if self.role != expected {
            return Err(SessionError::WrongRole {
                expected,
                actual: self.role,
            });
        }
        Ok(())
    }

    /// Back to idle; the sender starts heartbeating if it is not already.
    fn enter_idle(&mut self) {
        self.state = SessionState::Idle;
        if self.role != Role::Sender || self.heartbeat.is_some() {
            return;
        }
        if let Some(socket) = self.socket.clone() {
            self.heartbeat = Some(Heartbeat::spawn(
                socket,
                self.peer,
                self.config.timeouts,
                self.inbox_tx.clone(),
            ));
        }
    }

    /// Stop the heartbeat before the foreground reads the socket.
    ///
    /// The handle stays in place until the task has ended, so a dropped call
    /// can be resumed.
    async fn pause_heartbeat(&mut self) -> Result<(), SessionError> {
        let Some(hb) = self.heartbeat.as_mut() else {
            return Ok(());
        };
        hb.request_stop();
        let outcome = hb.finished().await;
        self.heartbeat = None;
        log::debug!("[keepalive] stopped: {outcome:?}");
        match outcome {
            LivenessOutcome::Stopped => Ok(()),
            LivenessOutcome::PeerLost | LivenessOutcome::SocketFailed => {
                self.close().await;
                Err(SessionError::PeerUnresponsive)
            }
        }
    }

    /// Act on a switch or terminate received while holding the role.
    async fn obey(&mut self, flag: Flag) -> Result<Instruction, SessionError> {
        let socket = self.socket()?;
        match flag {
            Flag::SwitchRole => {
                self.state = SessionState::Switching;
                socket.send_to(&Frame::control(Flag::SwitchRole), self.peer).await?;
                self.flip_role();
                Ok(Instruction::SwitchRole)
            }
            _ => {
                // Courtesy echo; the peer may already be gone.
                let _ = socket.send_to(&Frame::control(Flag::Terminate), self.peer).await;
                drop(socket);
                self.close().await;
                log::info!("Connection terminated by peer");
                Ok(Instruction::Terminate)
            }
        }
    }

    fn flip_role(&mut self) {
        self.role = self.role.flipped();
        self.reassembler = Reassembler::new();
        self.pending = None;
        while self.inbox_rx.try_recv().is_ok() {}
        log::info!("[session] role switched; now {}", self.role);
        self.enter_idle();
    }

    fn deliver(&mut self, completed: Completed) -> Result<(), SessionError> {
        match &completed {
            Completed::Text { size, .. } => log::info!("Message received: {size} B"),
            Completed::File { name, size, .. } => log::info!("File {name} received: {size} B"),
        }
        self.sink.deliver(completed).map_err(|e| {
            log::error!("[session] storage sink failed: {e}");
            SessionError::Storage(e)
        })
    }

    /// Stop any background task, then drop the socket.
    async fn close(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.stop().await;
        }
        self.socket = None;
        self.state = SessionState::Terminated;
        log::debug!("[session] closed");
    }
}

/// Read until a frame with one of `flags` arrives (from `from`, if given)
/// or `wait` expires.  `Ok(None)` on expiry.
async fn recv_matching(
    socket: &Socket,
    from: Option<SocketAddr>,
    flags: &[Flag],
    wait: Duration,
) -> Result<Option<(Frame, SocketAddr)>, SocketError> {
    let deadline = Instant::now() + wait;
    loop {
        match timeout_at(deadline, socket.recv_from()).await {
            Err(_elapsed) => return Ok(None),
            Ok(Ok((frame, addr))) => {
                if from.is_some_and(|f| f != addr) || !flags.contains(&frame.flag) {
                    log::debug!("[session] skipping {} from {addr}", frame.flag);
                    continue;
                }
                return Ok(Some((frame, addr)));
            }
            Ok(Err(e)) if e.is_transient() => {}
            Ok(Err(e)) => return Err(e),
        }
    }
}
