//! In-process loopback link
//!
//! Two single-slot mailboxes, one per direction. A slot holds at most one
//! frame; sending into an occupied slot reports [`TransportError::Busy`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{Transport, TransportError};

/// Largest frame the link accepts (ISO-TP single-message limit)
pub const MAX_FRAME_LEN: usize = 4095;

type Slot = Arc<Mutex<Option<Vec<u8>>>>;

/// Factory for a connected endpoint pair
pub struct LoopbackLink;

impl LoopbackLink {
    /// Create a connected `(tester, ecu)` endpoint pair
    pub fn pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
        let to_ecu: Slot = Arc::new(Mutex::new(None));
        let to_tester: Slot = Arc::new(Mutex::new(None));

        let tester = LoopbackEndpoint {
            name: "tester",
            outbound: to_ecu.clone(),
            inbound: to_tester.clone(),
        };
        let ecu = LoopbackEndpoint {
            name: "ecu",
            outbound: to_tester,
            inbound: to_ecu,
        };
        (tester, ecu)
    }
}

/// One side of a [`LoopbackLink`]
#[derive(Clone)]
pub struct LoopbackEndpoint {
    name: &'static str,
    outbound: Slot,
    inbound: Slot,
}

impl LoopbackEndpoint {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a frame sent by this side is still waiting for the peer
    pub fn outbound_pending(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Whether a frame is waiting to be received on this side
    pub fn inbound_pending(&self) -> bool {
        self.inbound.lock().is_some()
    }
}

impl Transport for LoopbackEndpoint {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.is_empty() {
            return Err(TransportError::EmptyFrame);
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let mut slot = self.outbound.lock();
        if slot.is_some() {
            return Err(TransportError::Busy);
        }
        trace!(from = self.name, frame = %hex::encode(frame), "Frame queued");
        *slot = Some(frame.to_vec());
        Ok(())
    }

    fn receive(&self) -> Option<Vec<u8>> {
        let frame = self.inbound.lock().take()?;
        trace!(to = self.name, frame = %hex::encode(&frame), "Frame delivered");
        Some(frame)
    }
}
