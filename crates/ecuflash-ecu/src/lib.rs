//! ecuflash-ecu - simulated flash bootloader
//!
//! [`EcuServer`] answers the UDS requests a tester issues while
//! reprogramming an ECU: session control, seed/key unlock, erase, download
//! and verification. The reconstructed image goes to a [`SinkProvider`].

pub mod config;
mod security;
pub mod server;
pub mod sink;
mod transfer;

pub use config::{ConfigError, EcuConfig, SequenceErrorPolicy};
pub use server::EcuServer;
pub use sink::{FileSinkProvider, ImageSink, MemorySinkProvider, SinkError, SinkProvider};
