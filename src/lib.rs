//! `udp-duplex`: reliable message and file transfer over UDP, with
//! stop-and-wait retransmission and mid-session role switching.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐   DATA seq=n    ┌────────────┐
//!  │ Peer       │────────────────▶│ Peer       │
//!  │ (Sender)   │◀────────────────│ (Receiver) │
//!  └────┬───────┘ ACCEPT / REJECT └─────┬──────┘
//!       │                               │
//!       │ Fragmenter ─▶ DeliveryEngine  │ DeliveryEngine ─▶ Reassembler ─▶ StorageSink
//!       │ Heartbeat task (while idle)   │
//!       │                               │
//!  ┌────▼───────────────────────────────▼──┐
//!  │  Socket (thin async wrapper around    │
//!  │  tokio UdpSocket, speaks Frames)      │
//!  └───────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: wire format, CRC-16 checksum
//! - [`simulator`]: deliberate checksum corruption for testing resends
//! - [`config`]: validated transfer jobs and session settings
//! - [`timer`]: named, overridable timeouts
//! - [`sender`]: fragmentation and the in-flight fragment
//! - [`receiver`]: duplicate suppression and reassembly
//! - [`sink`]: where completed transfers are stored
//! - [`socket`]: async UDP socket abstraction
//! - [`delivery`]: stop-and-wait ARQ engine
//! - [`keepalive`]: heartbeat task with escalating deadlines
//! - [`state`]: finite-state-machine types
//! - [`connection`]: the [`Peer`] session controller

pub mod config;
pub mod connection;
pub mod delivery;
pub mod keepalive;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod sink;
pub mod socket;
pub mod state;
pub mod timer;

pub use config::{ConfigError, DuplicatePolicy, SessionConfig, TransferJob};
pub use connection::{Command, Instruction, Peer, ServeOutcome, SessionError};
pub use delivery::TransferReport;
pub use sink::{Delivery, DirectorySink, MemorySink, StorageSink};
pub use state::{LivenessStatus, Role, SessionState};
pub use timer::Timeouts;
