//! Error taxonomy for the streaming engine.
//!
//! Construction-time errors are absorbed by [`crate::sound::Sound::new`] into an inert
//! handle; they are only surfaced to callers that go through `Sound::try_new`.

use std::path::PathBuf;

/// Failures raised by the pool, the decoder binding and the buffer ring.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Every channel in the fixed pool is owned by another sound.
    #[error("no free channel (all {capacity} channels in use)")]
    ChannelPoolExhausted { capacity: usize },

    /// The source file is missing or unreadable.
    #[error("failed to open {path:?}")]
    SourceOpenFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unsupported stream header, or the buffer ring could not be allocated.
    #[error("decoder init failed: {reason}")]
    DecoderInitFailure { reason: String },

    /// A corrupt frame was hit mid-stream.
    #[error("decode read failed: {0}")]
    DecodeRead(#[source] symphonia::core::errors::Error),

    /// The stream could not be repositioned.
    #[error("seek failed: {0}")]
    Seek(#[source] symphonia::core::errors::Error),

    /// The playback thread could not be spawned.
    #[error("failed to spawn playback task for channel {channel}")]
    TaskSpawn {
        channel: usize,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    pub(crate) fn init(reason: impl Into<String>) -> Self {
        Self::DecoderInitFailure {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_capacity() {
        let err = StreamError::ChannelPoolExhausted { capacity: 24 };
        assert_eq!(err.to_string(), "no free channel (all 24 channels in use)");
    }

    #[test]
    fn source_open_failure_keeps_io_cause() {
        let err = StreamError::SourceOpenFailure {
            path: PathBuf::from("missing.ogg"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let source = std::error::Error::source(&err).expect("io cause");
        let io = source.downcast_ref::<std::io::Error>().expect("io error");
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
