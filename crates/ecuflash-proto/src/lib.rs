//! ecuflash-proto - shared protocol layer for the ecuflash tester and ECU
//!
//! Everything both ends of the link must agree on bit-for-bit lives here:
//!
//! - [`codec`] - big-endian field access and the CRC-32 used for image checks
//! - [`uds`] - service identifiers, sub-functions, routine ids, NRCs and
//!   response classification
//! - [`security`] - seed/key derivation for SecurityAccess
//! - [`transport`] - the frame transport trait and the in-process loopback link
//! - [`clock`] - millisecond time source used for every deadline
//!
//! ```text
//!   tester (FlashOrchestrator)              ECU (EcuServer)
//!            │                                     ▲
//!            ▼          LoopbackLink::pair()       │
//!   ┌─────────────────┐  ──── request slot ────▶  ┌─────────────────┐
//!   │ LoopbackEndpoint│                           │ LoopbackEndpoint│
//!   └─────────────────┘  ◀─── response slot ────  └─────────────────┘
//! ```

pub mod clock;
pub mod codec;
pub mod security;
pub mod transport;
pub mod uds;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::{crc32, CRC_SEED};
pub use security::derive_key;
pub use transport::{LoopbackEndpoint, LoopbackLink, Transport, TransportError};
pub use uds::{DiagnosticSession, NegativeResponseCode, UdsResponse};
