//! ecuflash-client - UDS tester for firmware updates
//!
//! [`FlashOrchestrator`] walks an ECU through the programming sequence:
//!
//! 1. default session, software version, extended session
//! 2. DTC setting off, communication off, programming session
//! 3. seed/key unlock, erase, RequestDownload
//! 4. TransferData blocks until the image is sent, RequestTransferExit
//! 5. CRC check, programming dependency check, extended session, reset
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ecuflash_client::{FirmwareImage, FlashConfig, FlashOrchestrator};
//! use ecuflash_proto::MonotonicClock;
//!
//! let mut orchestrator = FlashOrchestrator::new(FlashConfig::default(), Arc::new(MonotonicClock::new()));
//! orchestrator.start(FirmwareImage::load("app.bin")?)?;
//! while !orchestrator.is_done() {
//!     ecu.poll(&ecu_end);
//!     orchestrator.tick(&tester_end);
//! }
//! println!("{:?}", orchestrator.report());
//! ```

pub mod config;
pub mod error;
pub mod image;
pub mod job;
pub mod orchestrator;
pub mod step;

pub use config::{ConfigError, FlashConfig, FlashConfigBuilder, TimeoutsConfig};
pub use error::{FlashError, Result};
pub use image::{FirmwareImage, ImageError};
pub use job::{AbortReason, FlashJob, JobOutcome, JobReport};
pub use orchestrator::FlashOrchestrator;
pub use step::FlashStep;
