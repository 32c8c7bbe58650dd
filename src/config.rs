//! Validated configuration handed to the protocol core.
//!
//! The interactive layer (prompts, file reading) lives outside the library;
//! it hands over a [`TransferJob`] per send and one [`SessionConfig`] per
//! session.  Everything is checked synchronously here, so a bad fragment size
//! or error rate is rejected before a single frame is sent and the session
//! stays usable.

use thiserror::Error;

use crate::packet::MAX_PAYLOAD;
use crate::timer::Timeouts;

/// Highest error rate a sender may inject.
pub const MAX_ERROR_RATE: f64 = 0.8;

/// Sequence numbers are u16 and 0 is reserved, so at most this many data
/// fragments fit in one transfer.
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Rejected configuration (`ConfigurationInvalid`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("fragment size {0} B outside 1..=1467 B")]
    FragmentSize(usize),
    #[error("error rate {0} outside 0.0..=0.8")]
    ErrorRate(f64),
    #[error("{len} B at {fragment_size} B per fragment needs {count} fragments; at most 65535 fit")]
    TooManyFragments {
        len: usize,
        fragment_size: usize,
        count: usize,
    },
    #[error("file name must be 1..=1467 bytes, got {0} bytes")]
    FileName(usize),
}

/// One logical send of a message or a file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
    payload: Vec<u8>,
    fragment_size: usize,
    error_rate: f64,
    /// Present only for file transfers.
    name: Option<String>,
}

impl TransferJob {
    /// A text message transfer.
    pub fn text(
        message: impl Into<String>,
        fragment_size: usize,
        error_rate: f64,
    ) -> Result<Self, ConfigError> {
        Self::build(message.into().into_bytes(), None, fragment_size, error_rate)
    }

    /// A file transfer; `name` is announced at sequence 0.
    pub fn file(
        name: impl Into<String>,
        content: Vec<u8>,
        fragment_size: usize,
        error_rate: f64,
    ) -> Result<Self, ConfigError> {
        Self::build(content, Some(name.into()), fragment_size, error_rate)
    }

    /// Like [`TransferJob::text`], but a fragment size too small for the
    /// sequence space is enlarged instead of rejected.
    pub fn text_fitted(
        message: impl Into<String>,
        fragment_size: usize,
        error_rate: f64,
    ) -> Result<Self, ConfigError> {
        let payload = message.into().into_bytes();
        let fragment_size = fragment_size.max(Self::min_fragment_size(payload.len()));
        Self::build(payload, None, fragment_size, error_rate)
    }

    /// Like [`TransferJob::file`], enlarging the fragment size if needed.
    pub fn file_fitted(
        name: impl Into<String>,
        content: Vec<u8>,
        fragment_size: usize,
        error_rate: f64,
    ) -> Result<Self, ConfigError> {
        let fragment_size = fragment_size.max(Self::min_fragment_size(content.len()));
        Self::build(content, Some(name.into()), fragment_size, error_rate)
    }

    /// Smallest fragment size that keeps `len` bytes within [`MAX_FRAGMENTS`].
    pub fn min_fragment_size(len: usize) -> usize {
        len.div_ceil(MAX_FRAGMENTS).max(1)
    }

    /// Check a fragment size and error rate without building a job.
    pub fn check_limits(fragment_size: usize, error_rate: f64) -> Result<(), ConfigError> {
        if fragment_size == 0 || fragment_size > MAX_PAYLOAD {
            return Err(ConfigError::FragmentSize(fragment_size));
        }
        if !(0.0..=MAX_ERROR_RATE).contains(&error_rate) {
            return Err(ConfigError::ErrorRate(error_rate));
        }
        Ok(())
    }

    fn build(
        payload: Vec<u8>,
        name: Option<String>,
        fragment_size: usize,
        error_rate: f64,
    ) -> Result<Self, ConfigError> {
        Self::check_limits(fragment_size, error_rate)?;
        let count = payload.len().div_ceil(fragment_size);
        if count > MAX_FRAGMENTS {
            return Err(ConfigError::TooManyFragments {
                len: payload.len(),
                fragment_size,
                count,
            });
        }
        if let Some(ref n) = name {
            if n.is_empty() || n.len() > MAX_PAYLOAD {
                return Err(ConfigError::FileName(n.len()));
            }
        }
        Ok(Self {
            payload,
            fragment_size,
            error_rate,
            name,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of data fragments (excluding the name announcement).
    pub fn fragment_count(&self) -> usize {
        self.payload.len().div_ceil(self.fragment_size)
    }
}

/// What the receiver does with a data frame whose sequence it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Answer with accept again, so a lost accept costs one round trip.
    #[default]
    Reacknowledge,
    /// Drop silently; the sender will time out if its accept was lost.
    Ignore,
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub timeouts: Timeouts,
    pub duplicate_policy: DuplicatePolicy,
    /// Seed for the corruption injector; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_job_counts_fragments() {
        let job = TransferJob::text("HELLOX", 4, 0.0).unwrap();
        assert_eq!(job.fragment_count(), 2);
        assert_eq!(job.name(), None);
    }

    #[test]
    fn fragment_size_bounds() {
        assert_eq!(
            TransferJob::text("x", 0, 0.0),
            Err(ConfigError::FragmentSize(0))
        );
        assert_eq!(
            TransferJob::text("x", 1468, 0.0),
            Err(ConfigError::FragmentSize(1468))
        );
        assert!(TransferJob::text("x", 1467, 0.0).is_ok());
    }

    #[test]
    fn error_rate_bounds() {
        assert_eq!(
            TransferJob::text("x", 4, 0.81),
            Err(ConfigError::ErrorRate(0.81))
        );
        assert!(matches!(
            TransferJob::text("x", 4, -0.1),
            Err(ConfigError::ErrorRate(_))
        ));
        assert!(TransferJob::text("x", 4, f64::NAN).is_err());
        assert!(TransferJob::text("x", 4, 0.8).is_ok());
    }

    #[test]
    fn limits_checked_without_a_payload() {
        assert_eq!(TransferJob::check_limits(1467, 0.8), Ok(()));
        assert_eq!(
            TransferJob::check_limits(0, 0.1),
            Err(ConfigError::FragmentSize(0))
        );
        assert_eq!(
            TransferJob::check_limits(64, 0.9),
            Err(ConfigError::ErrorRate(0.9))
        );
    }

    #[test]
    fn too_many_fragments_rejected() {
        let content = vec![0u8; MAX_FRAGMENTS + 1];
        assert_eq!(
            TransferJob::file("big", content, 1, 0.0),
            Err(ConfigError::TooManyFragments {
                len: MAX_FRAGMENTS + 1,
                fragment_size: 1,
                count: MAX_FRAGMENTS + 1,
            })
        );
    }

    #[test]
    fn exactly_max_fragments_accepted() {
        let job = TransferJob::file("edge", vec![0u8; MAX_FRAGMENTS], 1, 0.0).unwrap();
        assert_eq!(job.fragment_count(), MAX_FRAGMENTS);
    }

    #[test]
    fn fitted_enlarges_fragment_size() {
        let content = vec![0u8; MAX_FRAGMENTS * 3 + 1];
        let job = TransferJob::file_fitted("big", content, 1, 0.0).unwrap();
        assert_eq!(job.fragment_size(), 4);
        assert!(job.fragment_count() <= MAX_FRAGMENTS);
    }

    #[test]
    fn fitted_keeps_larger_requested_size() {
        let job = TransferJob::text_fitted("hello", 100, 0.0).unwrap();
        assert_eq!(job.fragment_size(), 100);
    }

    #[test]
    fn file_name_bounds() {
        assert_eq!(
            TransferJob::file("", vec![1], 1, 0.0),
            Err(ConfigError::FileName(0))
        );
        let long = "n".repeat(MAX_PAYLOAD + 1);
        assert!(TransferJob::file(long, vec![1], 1, 0.0).is_err());
    }

    #[test]
    fn min_fragment_size_never_zero() {
        assert_eq!(TransferJob::min_fragment_size(0), 1);
        assert_eq!(TransferJob::min_fragment_size(MAX_FRAGMENTS), 1);
        assert_eq!(TransferJob::min_fragment_size(MAX_FRAGMENTS + 1), 2);
    }
}
