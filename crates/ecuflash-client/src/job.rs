//! Firmware job bookkeeping and the report a finished job leaves behind

use std::fmt;

use ecuflash_proto::NegativeResponseCode;
use serde::Serialize;

use crate::image::FirmwareImage;
use crate::step::FlashStep;

/// An image on its way to the ECU: how much has been acknowledged and which
/// block counter goes out next
#[derive(Debug)]
pub struct FlashJob {
    image: FirmwareImage,
    start_address: u32,
    offset: usize,
    next_block: u8,
    block_counter_wrap: u8,
    blocks_sent: u32,
    done: bool,
}

impl FlashJob {
    pub fn new(image: FirmwareImage, start_address: u32, block_counter_wrap: u8) -> Self {
        Self {
            image,
            start_address,
            offset: 0,
            next_block: 1,
            block_counter_wrap,
            blocks_sent: 0,
            done: false,
        }
    }

    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    /// Sequence counter for the next TransferData block
    pub fn next_block(&self) -> u8 {
        self.next_block
    }

    pub fn bytes_sent(&self) -> usize {
        self.offset
    }

    pub fn blocks_sent(&self) -> u32 {
        self.blocks_sent
    }

    pub fn remaining(&self) -> usize {
        self.image.len() - self.offset
    }

    pub fn has_more(&self) -> bool {
        self.remaining() > 0
    }

    /// Next unacknowledged slice of at most `block_size` bytes
    pub fn chunk(&self, block_size: usize) -> &[u8] {
        let end = self.offset + block_size.min(self.remaining());
        &self.image.as_bytes()[self.offset..end]
    }

    /// Record that the ECU accepted a block of `len` bytes
    pub fn acknowledge(&mut self, len: usize) {
        self.offset = (self.offset + len).min(self.image.len());
        self.blocks_sent += 1;
        self.next_block = self.next_block.wrapping_add(1);
        if self.next_block == 0 && self.block_counter_wrap > 0 {
            self.next_block = self.block_counter_wrap;
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn finish(&mut self) {
        self.done = true;
    }
}

/// Why a job stopped before completing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// No response within the response timeout
    Timeout { step: FlashStep },
    /// The ECU answered with a negative response
    Negative {
        step: FlashStep,
        service: u8,
        nrc: NegativeResponseCode,
    },
    /// A positive response whose payload could not be used
    InvalidResponse { step: FlashStep, detail: String },
    /// The link refused the request outright
    Transport { step: FlashStep, error: String },
}

impl AbortReason {
    pub fn step(&self) -> FlashStep {
        match self {
            AbortReason::Timeout { step }
            | AbortReason::Negative { step, .. }
            | AbortReason::InvalidResponse { step, .. }
            | AbortReason::Transport { step, .. } => *step,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Timeout { step } => write!(f, "no response at {:?}", step),
            AbortReason::Negative { step, service, nrc } => write!(
                f,
                "{:?} rejected (service 0x{:02X}, NRC {})",
                step, service, nrc
            ),
            AbortReason::InvalidResponse { step, detail } => {
                write!(f, "invalid response at {:?}: {}", step, detail)
            }
            AbortReason::Transport { step, error } => {
                write!(f, "transport error at {:?}: {}", step, error)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Aborted(AbortReason),
}

/// Summary of a finished job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub outcome: JobOutcome,

    /// Version string read before programming, if that step was reached
    pub software_version: Option<String>,

    pub blocks_sent: u32,
    pub bytes_sent: u64,
    pub image_len: u64,
    pub image_crc: u32,
    pub elapsed_ms: u64,
}

impl JobReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == JobOutcome::Completed
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.outcome {
            JobOutcome::Completed => None,
            JobOutcome::Aborted(reason) => Some(reason),
        }
    }
}
