//! Error types for flash client operations

use thiserror::Error;

use crate::image::ImageError;
use crate::step::FlashStep;

/// Result type alias for flash client operations
pub type Result<T> = std::result::Result<T, FlashError>;

/// Errors returned when a job cannot be started
///
/// Failures during a running job are not errors; they end the job and are
/// reported through [`crate::JobReport`].
#[derive(Error, Debug)]
pub enum FlashError {
    /// A job is already running
    #[error("Flash job already in progress (at {0:?})")]
    Busy(FlashStep),

    #[error(transparent)]
    Image(#[from] ImageError),
}
