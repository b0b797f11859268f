//! Frame transport abstraction
//!
//! The protocol engines only need "send a frame" and "take a frame if one is
//! waiting". Both calls are non-blocking.

mod error;
mod loopback;

pub use error::TransportError;
pub use loopback::{LoopbackEndpoint, LoopbackLink, MAX_FRAME_LEN};

/// One end of a bidirectional frame link
pub trait Transport: Send {
    /// Queue a frame for the peer.
    ///
    /// [`TransportError::Busy`] is backpressure, not failure.
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Take the next inbound frame, if any
    fn receive(&self) -> Option<Vec<u8>>;
}
