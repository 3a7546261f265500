//! Error types for the multiplexer.

use tokio::sync::mpsc::error::TrySendError;

#[derive(thiserror::Error, Debug)]
/// Error
pub enum Error {
    /// Frame could not be serialized
    #[error("Serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound channel is full
    #[error("Channel is full")]
    ChannelFull,

    /// Outbound channel is closed
    #[error("Channel is closed")]
    ChannelClosed,
}

impl<T> From<TrySendError<T>> for Error {
    fn from(value: TrySendError<T>) -> Self {
        match value {
            TrySendError::Closed(_) => Error::ChannelClosed,
            TrySendError::Full(_) => Error::ChannelFull,
        }
    }
}
