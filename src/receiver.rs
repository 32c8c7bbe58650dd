//! Inbound fragment bookkeeping.
//!
//! The [`Reassembler`] is responsible for everything that happens *after* a
//! data frame is decoded and *before* the completed payload reaches the
//! storage sink:
//! - Suppressing duplicates by sequence number.
//! - Refusing fragments whose checksum did not verify.
//! - Recognising the file-name announcement at sequence 0.
//! - Accumulating accepted payloads in arrival order.
//!
//! It does **not** send replies; [`AcceptResult::reply`] tells the caller
//! which flag (if any) to answer with.

use std::collections::HashSet;

use crate::packet::Flag;

/// Outcome of offering one data fragment to the [`Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptResult {
    /// Payload fragment recorded.
    Accepted,
    /// Sequence 0 recorded as the transfer's file name.
    NameDeclared,
    /// Checksum mismatch; nothing recorded.
    Rejected,
    /// Sequence already accepted; nothing changed.
    Duplicate,
}

impl AcceptResult {
    /// Reply flag owed to the sender, `None` for a duplicate.
    pub fn reply(self) -> Option<Flag> {
        match self {
            AcceptResult::Accepted | AcceptResult::NameDeclared => Some(Flag::Accept),
            AcceptResult::Rejected => Some(Flag::Reject),
            AcceptResult::Duplicate => None,
        }
    }
}

/// Receiver-side state for the transfer in progress.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    accepted: HashSet<u16>,
    /// Accepted payloads in arrival order.
    fragments: Vec<Vec<u8>>,
    total_len: usize,
    name: Option<String>,
}

impl ReassemblyBuffer {
    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// A finished transfer, ready for the storage sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    Text { text: String, size: usize },
    File {
        name: String,
        fragments: Vec<Vec<u8>>,
        size: usize,
    },
}

/// Accumulates one transfer at a time.
#[derive(Debug, Default)]
pub struct Reassembler {
    /// `None` between transfers.
    buffer: Option<ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once the first data frame of a transfer has arrived and until
    /// [`Reassembler::finish`] is called.
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&ReassemblyBuffer> {
        self.buffer.as_ref()
    }

    /// Offer one data fragment.
    pub fn accept(&mut self, sequence: u16, payload: &[u8], checksum_valid: bool) -> AcceptResult {
        let buf = self.buffer.get_or_insert_with(ReassemblyBuffer::default);

        if buf.accepted.contains(&sequence) {
            return AcceptResult::Duplicate;
        }
        if !checksum_valid {
            return AcceptResult::Rejected;
        }
        buf.accepted.insert(sequence);

        if sequence == 0 && buf.name.is_none() {
            buf.name = Some(String::from_utf8_lossy(payload).into_owned());
            return AcceptResult::NameDeclared;
        }

        buf.total_len += payload.len();
        buf.fragments.push(payload.to_vec());
        AcceptResult::Accepted
    }

    /// Close the transfer and reset for the next one.
    ///
    /// Without a declared name the fragments are joined and decoded as
    /// UTF-8 text (lossy); otherwise they are handed over as file content.
    pub fn finish(&mut self) -> Completed {
        let buf = self.buffer.take().unwrap_or_default();
        let size = buf.total_len;
        match buf.name {
            Some(name) => Completed::File {
                name,
                fragments: buf.fragments,
                size,
            },
            None => {
                let bytes = buf.fragments.concat();
                Completed::Text {
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                    size,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_scenario_reassembles() {
        let mut r = Reassembler::new();
        assert_eq!(r.accept(1, b"HELL", true), AcceptResult::Accepted);
        assert_eq!(r.accept(2, b"OX", true), AcceptResult::Accepted);
        assert_eq!(
            r.finish(),
            Completed::Text {
                text: "HELLOX".into(),
                size: 6
            }
        );
        assert!(!r.in_progress());
    }

    #[test]
    fn duplicate_counts_once_and_gets_no_reply() {
        let mut r = Reassembler::new();
        assert_eq!(r.accept(1, b"abc", true), AcceptResult::Accepted);
        assert_eq!(r.buffer().unwrap().len(), 3);

        let dup = r.accept(1, b"abc", true);
        assert_eq!(dup, AcceptResult::Duplicate);
        assert_eq!(dup.reply(), None);
        assert_eq!(r.buffer().unwrap().len(), 3);
        assert_eq!(r.buffer().unwrap().fragment_count(), 1);
    }

    #[test]
    fn corrupted_fragment_rejected_then_accepted() {
        let mut r = Reassembler::new();
        let res = r.accept(1, b"abc", false);
        assert_eq!(res, AcceptResult::Rejected);
        assert_eq!(res.reply(), Some(Flag::Reject));
        assert!(r.buffer().unwrap().is_empty());

        assert_eq!(r.accept(1, b"abc", true), AcceptResult::Accepted);
        assert_eq!(r.buffer().unwrap().len(), 3);
    }

    #[test]
    fn corrupted_duplicate_is_still_duplicate() {
        let mut r = Reassembler::new();
        r.accept(1, b"abc", true);
        assert_eq!(r.accept(1, b"abc", false), AcceptResult::Duplicate);
    }

    #[test]
    fn sequence_zero_declares_file_name() {
        let mut r = Reassembler::new();
        assert_eq!(r.accept(0, b"a.bin", true), AcceptResult::NameDeclared);
        assert_eq!(AcceptResult::NameDeclared.reply(), Some(Flag::Accept));
        r.accept(1, &[1, 2], true);
        r.accept(2, &[3, 4], true);
        r.accept(3, &[5], true);
        assert_eq!(r.buffer().unwrap().name(), Some("a.bin"));
        assert_eq!(
            r.finish(),
            Completed::File {
                name: "a.bin".into(),
                fragments: vec![vec![1, 2], vec![3, 4], vec![5]],
                size: 5,
            }
        );
    }

    #[test]
    fn fragments_kept_in_arrival_order() {
        let mut r = Reassembler::new();
        r.accept(0, b"f", true);
        r.accept(2, b"B", true);
        r.accept(1, b"A", true);
        match r.finish() {
            Completed::File { fragments, .. } => {
                assert_eq!(fragments, vec![b"B".to_vec(), b"A".to_vec()])
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn multibyte_text_split_across_fragments() {
        let text = "žluťoučký kůň";
        let mut r = Reassembler::new();
        for (i, chunk) in text.as_bytes().chunks(3).enumerate() {
            r.accept(i as u16 + 1, chunk, true);
        }
        match r.finish() {
            Completed::Text { text: got, size } => {
                assert_eq!(got, text);
                assert_eq!(size, text.len());
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn finish_without_fragments_is_empty_text() {
        let mut r = Reassembler::new();
        assert_eq!(
            r.finish(),
            Completed::Text {
                text: String::new(),
                size: 0
            }
        );
    }

    #[test]
    fn finish_resets_duplicate_set() {
        let mut r = Reassembler::new();
        r.accept(1, b"x", true);
        r.finish();
        assert_eq!(r.accept(1, b"y", true), AcceptResult::Accepted);
    }
}
