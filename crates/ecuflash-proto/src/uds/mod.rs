//! UDS wire constants and response framing

mod nrc;

pub use nrc::NegativeResponseCode;

use serde::Serialize;

/// UDS Service IDs
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Offset added to a service id in its positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// ECUReset sub-functions
pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
}

/// SecurityAccess sub-functions
///
/// This ECU uses a vendor-specific level pair rather than the usual 0x01/0x02.
pub mod security_sub_function {
    pub const REQUEST_SEED: u8 = 0x05;
    pub const SEND_KEY: u8 = 0x06;
}

/// ControlDTCSetting sub-functions
pub mod dtc_setting {
    pub const ON: u8 = 0x01;
    pub const OFF: u8 = 0x02;
}

/// CommunicationControl sub-functions and communication type
pub mod communication_control {
    pub const RX_ON_TX_ON: u8 = 0x00;
    pub const RX_ON_TX_OFF: u8 = 0x01;
    pub const RX_OFF_TX_ON: u8 = 0x02;
    pub const RX_OFF_TX_OFF: u8 = 0x03;
    /// Normal communication messages
    pub const NORMAL_MESSAGES: u8 = 0x01;
}

/// RoutineControl sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
}

/// RoutineControl routine identifiers
pub mod routine_id {
    pub const ERASE_MEMORY: u16 = 0xFF00;
    pub const CHECK_MEMORY: u16 = 0x0200;
    pub const CHECK_PROGRAMMING_DEPENDENCY: u16 = 0xFF01;
}

/// Data identifiers
pub mod data_id {
    pub const SOFTWARE_VERSION: u16 = 0xF195;
}

/// Address-and-length format identifier: 4-byte address, 4-byte size
pub const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;

/// Data format identifier for RequestDownload: no compression, no encryption
pub const DATA_FORMAT_PLAIN: u8 = 0x00;

/// TesterPresent suppress-positive-response bit
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Diagnostic session types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSession {
    Default,
    Programming,
    Extended,
}

impl DiagnosticSession {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Default),
            0x02 => Some(Self::Programming),
            0x03 => Some(Self::Extended),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
        }
    }
}

/// Create a positive response for a service
pub fn positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET));
    response.extend_from_slice(data);
    response
}

/// Create a negative response
pub fn negative_response(service_id: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, service_id, nrc.into()]
}

/// A classified response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// `service | 0x40` followed by service-specific data
    Positive { service: u8, data: Vec<u8> },
    /// `0x7F <service> <nrc>`
    Negative {
        service: u8,
        nrc: NegativeResponseCode,
    },
}

impl UdsResponse {
    /// Classify a raw response frame. Returns `None` for frames that are
    /// neither a well-formed negative response nor a positive response.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let (&first, rest) = frame.split_first()?;
        if first == service_id::NEGATIVE_RESPONSE {
            if frame.len() < 3 {
                return None;
            }
            return Some(Self::Negative {
                service: frame[1],
                nrc: NegativeResponseCode::from(frame[2]),
            });
        }
        if first & POSITIVE_RESPONSE_OFFSET == 0 {
            return None;
        }
        Some(Self::Positive {
            service: first - POSITIVE_RESPONSE_OFFSET,
            data: rest.to_vec(),
        })
    }

    /// Service id the response answers
    pub fn service(&self) -> u8 {
        match self {
            Self::Positive { service, .. } | Self::Negative { service, .. } => *service,
        }
    }
}
