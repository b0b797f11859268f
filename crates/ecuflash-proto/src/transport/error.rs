//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer has not consumed the previous frame yet; retry later
    #[error("Peer mailbox occupied")]
    Busy,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Refusing to send an empty frame")]
    EmptyFrame,
}

impl TransportError {
    /// Whether the caller should simply try again on a later tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }
}
