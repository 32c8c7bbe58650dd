//! Outbound fragment state for stop-and-wait reliability.
//!
//! [`Fragmenter`] slices a [`TransferJob`] into data frames; [`InFlight`]
//! tracks the single frame currently awaiting a reply.  Neither touches the
//! socket; [`crate::delivery`] owns the actual send/receive loop.
//!
//! # Stop-and-Wait contract
//! - At most **one** fragment is in flight at any moment.
//! - On accept: the next fragment may be taken from the [`Fragmenter`].
//! - On reject: the same fragment is re-sealed with a fresh corruption draw.
//! - On timeout: the exact bytes already sent go out again, once.

use std::slice::Chunks;

use crate::config::TransferJob;
use crate::packet::Frame;
use crate::simulator::ErrorInjector;

// ---------------------------------------------------------------------------
// Fragmenter
// ---------------------------------------------------------------------------

/// Lazy, finite, non-restartable sequence of frames for one transfer.
///
/// A file transfer yields its name announcement (sequence 0) first; data
/// fragments are numbered from 1.  Frames carry a clean checksum.
#[derive(Debug)]
pub struct Fragmenter<'a> {
    announcement: Option<&'a str>,
    chunks: Chunks<'a, u8>,
    next_seq: u16,
}

impl<'a> Fragmenter<'a> {
    pub fn new(job: &'a TransferJob) -> Self {
        Self {
            announcement: job.name(),
            chunks: job.payload().chunks(job.fragment_size()),
            next_seq: 1,
        }
    }
}

impl Iterator for Fragmenter<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if let Some(name) = self.announcement.take() {
            return Some(Frame::announce(name));
        }
        let chunk = self.chunks.next()?;
        let frame = Frame::data(self.next_seq, chunk.to_vec());
        // TransferJob caps the fragment count at u16::MAX, so this never wraps
        // on a validated job.
        self.next_seq = self.next_seq.wrapping_add(1);
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.chunks.len() + usize::from(self.announcement.is_some());
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragmenter<'_> {}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// The fragment that has been sent but not yet answered.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// The fragment with its clean checksum.
    pub frame: Frame,
    /// Bytes of the most recent transmission (possibly corrupted).
    pub wire: Vec<u8>,
    /// How many times this fragment has been transmitted (1 = first send).
    pub tx_count: u32,
    /// Timeouts since the last reply of any kind.
    pub consecutive_timeouts: u32,
}

impl InFlight {
    /// Seal `frame` for its first transmission.
    ///
    /// The name announcement (sequence 0) is never corrupted on purpose.
    pub fn new(frame: Frame, injector: &mut ErrorInjector) -> Self {
        let wire = seal(&frame, injector);
        Self {
            frame,
            wire,
            tx_count: 1,
            consecutive_timeouts: 0,
        }
    }

    /// Prepare a resend after a reject: fresh corruption draw.
    pub fn on_reject(&mut self, injector: &mut ErrorInjector) {
        self.wire = seal(&self.frame, injector);
        self.consecutive_timeouts = 0;
        self.tx_count += 1;
    }

    /// Record a timeout.  Returns `true` while one more resend is allowed;
    /// the caller resends `wire` unchanged.
    pub fn on_timeout(&mut self, max_consecutive: u32) -> bool {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= max_consecutive {
            return false;
        }
        self.tx_count += 1;
        true
    }

    pub fn sequence(&self) -> u16 {
        self.frame.sequence
    }
}

fn seal(frame: &Frame, injector: &mut ErrorInjector) -> Vec<u8> {
    if frame.sequence == 0 {
        frame.encode()
    } else {
        frame.clone().with_injected_error(injector).encode()
    }
}
