//! Destinations for the downloaded image
//!
//! A [`SinkProvider`] opens one [`ImageSink`] per transfer. Sinks receive
//! every accepted TransferData payload in order and are finished on
//! RequestTransferExit. Dropping a sink without finishing it abandons the
//! transfer with whatever was already written.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Image sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Flush failed: {0}")]
    Flush(#[source] std::io::Error),

    #[error("Image exceeds sink capacity of {capacity} bytes")]
    CapacityExceeded { capacity: usize },
}

pub type SinkResult<T> = Result<T, SinkError>;

/// An open image destination
pub trait ImageSink: Send {
    fn write_block(&mut self, data: &[u8]) -> SinkResult<()>;

    fn finish(&mut self) -> SinkResult<()>;
}

/// Opens a fresh sink at the start of every transfer
pub trait SinkProvider: Send {
    fn open(&mut self) -> SinkResult<Box<dyn ImageSink>>;
}

// ── File sink ──────────────────────────────────────────────────────────

/// Writes the image to a file, truncating it on every new transfer
#[derive(Debug, Clone)]
pub struct FileSinkProvider {
    path: PathBuf,
}

impl FileSinkProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SinkProvider for FileSinkProvider {
    fn open(&mut self) -> SinkResult<Box<dyn ImageSink>> {
        let file = File::create(&self.path).map_err(|source| SinkError::Open {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Box::new(FileSink { file }))
    }
}

struct FileSink {
    file: File,
}

impl ImageSink for FileSink {
    fn write_block(&mut self, data: &[u8]) -> SinkResult<()> {
        self.file.write_all(data).map_err(SinkError::Write)?;
        // the reconstructed image must be readable while the transfer runs
        self.file.flush().map_err(SinkError::Flush)
    }

    fn finish(&mut self) -> SinkResult<()> {
        self.file.sync_all().map_err(SinkError::Flush)
    }
}

// ── Memory sink ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryImage {
    data: Vec<u8>,
    opens: usize,
    finished: bool,
}

/// Collects the image in a shared buffer
///
/// Clones observe the same buffer, so a test can keep one handle and give
/// the other to the ECU.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkProvider {
    image: Arc<Mutex<MemoryImage>>,
    capacity: Option<usize>,
}

impl MemorySinkProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail writes that would grow the image beyond `capacity` bytes
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            image: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Bytes written since the last open
    pub fn contents(&self) -> Vec<u8> {
        self.image.lock().data.clone()
    }

    /// Number of sinks opened so far
    pub fn open_count(&self) -> usize {
        self.image.lock().opens
    }

    /// Whether the current sink was finished
    pub fn is_finished(&self) -> bool {
        self.image.lock().finished
    }
}

impl SinkProvider for MemorySinkProvider {
    fn open(&mut self) -> SinkResult<Box<dyn ImageSink>> {
        {
            let mut image = self.image.lock();
            image.data.clear();
            image.opens += 1;
            image.finished = false;
        }
        Ok(Box::new(MemorySink {
            image: self.image.clone(),
            capacity: self.capacity,
        }))
    }
}

struct MemorySink {
    image: Arc<Mutex<MemoryImage>>,
    capacity: Option<usize>,
}

impl ImageSink for MemorySink {
    fn write_block(&mut self, data: &[u8]) -> SinkResult<()> {
        let mut image = self.image.lock();
        if let Some(capacity) = self.capacity {
            if image.data.len() + data.len() > capacity {
                return Err(SinkError::CapacityExceeded { capacity });
            }
        }
        image.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> SinkResult<()> {
        self.image.lock().finished = true;
        Ok(())
    }
}
