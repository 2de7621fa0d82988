//! Error types for anmp-ap
//!
//! One variant per failure class of the playback core. Whether a failure is
//! recovered by skipping the current playlist entry or ends the playback
//! session is decided by [`Error::is_source_local`].
//!
//! Real-time underruns are not errors; output backends count them and the
//! player reports the count out of band.

use thiserror::Error;

/// Main error type for anmp-ap
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or corrupt source (drop the source, continue the playlist)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// PCM buffer could not be allocated (song is unplayable)
    #[error("PCM allocation failed: {0}")]
    Allocation(String),

    /// Voice/channel layout or sample format is invalid
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    /// Output backend failure (ends the playback session)
    #[error("Audio output error: {0}")]
    Device(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the shared library
    #[error(transparent)]
    Common(#[from] anmp_common::Error),
}

impl Error {
    /// True if the failure only affects the current source.
    ///
    /// Source-local failures are recovered by skipping to the next playlist
    /// entry; everything else aborts the playback session.
    pub fn is_source_local(&self) -> bool {
        matches!(
            self,
            Error::Decode(_) | Error::Allocation(_) | Error::FormatMismatch(_)
        )
    }
}

/// Convenience Result type using anmp-ap Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_local_classification() {
        assert!(Error::Decode("x".into()).is_source_local());
        assert!(Error::Allocation("x".into()).is_source_local());
        assert!(Error::FormatMismatch("x".into()).is_source_local());
        assert!(!Error::Device("x".into()).is_source_local());
        assert!(!Error::InvalidState("x".into()).is_source_local());
    }
}
