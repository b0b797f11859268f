//! Download (tester to ECU) bookkeeping

use ecuflash_proto::{crc32, CRC_SEED};

use crate::sink::{ImageSink, SinkError};

/// Outcome of offering a TransferData block to the download state
#[derive(Debug)]
pub(crate) enum BlockOutcome {
    Accepted,
    /// Block counter did not match; nothing was written
    OutOfSequence { expected: u8 },
    /// No transfer is open and the block does not start one
    NotStarted,
    WriteFailed(SinkError),
}

/// Expected block counter, open sink and running tallies of what was written
pub(crate) struct DownloadState {
    expected_block: u8,
    block_counter_wrap: u8,
    sink: Option<Box<dyn ImageSink>>,
    bytes_written: u64,
    crc: u32,
    blocks: u64,
    /// Address and size announced by RequestDownload
    announced: Option<(u32, u32)>,
}

impl DownloadState {
    pub fn new(block_counter_wrap: u8) -> Self {
        Self {
            expected_block: 1,
            block_counter_wrap,
            sink: None,
            bytes_written: 0,
            crc: CRC_SEED,
            blocks: 0,
            announced: None,
        }
    }

    pub fn expected_block(&self) -> u8 {
        self.expected_block
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn announced(&self) -> Option<(u32, u32)> {
        self.announced
    }

    /// RequestDownload: forget any open transfer and expect block 1
    pub fn request(&mut self, address: u32, size: u32) -> bool {
        let discarded = self.sink.take().is_some();
        self.expected_block = 1;
        self.announced = Some((address, size));
        discarded
    }

    /// Whether block 1 should start a fresh sink.
    ///
    /// After 255 blocks the counter comes back around to 1; that block
    /// continues the open sink instead of restarting it.
    pub fn starts_new_image(&self, block: u8) -> bool {
        block == 1 && (self.sink.is_none() || self.blocks == 0 || self.expected_block != 1)
    }

    /// Replace any open sink with `sink` and reset the tallies
    pub fn begin(&mut self, sink: Box<dyn ImageSink>) {
        self.sink = Some(sink);
        self.expected_block = 1;
        self.bytes_written = 0;
        self.crc = CRC_SEED;
        self.blocks = 0;
    }

    pub fn write(&mut self, block: u8, data: &[u8]) -> BlockOutcome {
        let Some(sink) = self.sink.as_mut() else {
            return BlockOutcome::NotStarted;
        };
        if block != self.expected_block {
            return BlockOutcome::OutOfSequence {
                expected: self.expected_block,
            };
        }
        if let Err(e) = sink.write_block(data) {
            self.sink = None;
            return BlockOutcome::WriteFailed(e);
        }

        self.bytes_written += data.len() as u64;
        self.crc = crc32(self.crc, data);
        self.blocks += 1;

        self.expected_block = self.expected_block.wrapping_add(1);
        if self.expected_block == 0 && self.block_counter_wrap > 0 {
            self.expected_block = self.block_counter_wrap;
        }
        BlockOutcome::Accepted
    }

    /// Close the open sink, if any
    pub fn finish(&mut self) -> Result<bool, SinkError> {
        match self.sink.take() {
            Some(mut sink) => sink.finish().map(|_| true),
            None => Ok(false),
        }
    }

    /// Drop the open sink without finishing it
    pub fn abort(&mut self) -> bool {
        self.sink.take().is_some()
    }

    /// Whether the written image matches a claimed size and CRC
    pub fn matches(&self, size: u32, crc: u32) -> bool {
        self.bytes_written == u64::from(size) && self.crc == crc
    }
}
