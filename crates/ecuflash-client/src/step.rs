//! Flash sequence steps

use ecuflash_proto::uds::service_id;
use serde::Serialize;

/// One request/response exchange of the update sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashStep {
    Idle,
    EnterDefaultSession,
    ReadSoftwareVersion,
    EnterExtendedSession,
    DisableDtcSetting,
    DisableCommunication,
    EnterProgrammingSession,
    /// Pause before unlocking, nothing is sent
    Settle,
    RequestSeed,
    SendKey,
    EraseMemory,
    RequestDownload,
    TransferBlock,
    RequestTransferExit,
    CheckMemory,
    CheckProgDependency,
    ReenterExtendedSession,
    EcuReset,
    Done,
}

impl FlashStep {
    /// Step that follows this one.
    ///
    /// `more_blocks` is only consulted after `TransferBlock`, the one step
    /// that may repeat.
    pub fn next(self, more_blocks: bool) -> FlashStep {
        use FlashStep::*;
        match self {
            Idle => Idle,
            EnterDefaultSession => ReadSoftwareVersion,
            ReadSoftwareVersion => EnterExtendedSession,
            EnterExtendedSession => DisableDtcSetting,
            DisableDtcSetting => DisableCommunication,
            DisableCommunication => EnterProgrammingSession,
            EnterProgrammingSession => Settle,
            Settle => RequestSeed,
            RequestSeed => SendKey,
            SendKey => EraseMemory,
            EraseMemory => RequestDownload,
            RequestDownload => TransferBlock,
            TransferBlock if more_blocks => TransferBlock,
            TransferBlock => RequestTransferExit,
            RequestTransferExit => CheckMemory,
            CheckMemory => CheckProgDependency,
            CheckProgDependency => ReenterExtendedSession,
            ReenterExtendedSession => EcuReset,
            EcuReset => Done,
            Done => Idle,
        }
    }

    /// Service the step's request is sent with, if it sends one
    pub fn service(self) -> Option<u8> {
        use FlashStep::*;
        let sid = match self {
            EnterDefaultSession
            | EnterExtendedSession
            | EnterProgrammingSession
            | ReenterExtendedSession => service_id::DIAGNOSTIC_SESSION_CONTROL,
            ReadSoftwareVersion => service_id::READ_DATA_BY_ID,
            DisableDtcSetting => service_id::CONTROL_DTC_SETTING,
            DisableCommunication => service_id::COMMUNICATION_CONTROL,
            RequestSeed | SendKey => service_id::SECURITY_ACCESS,
            EraseMemory | CheckMemory | CheckProgDependency => service_id::ROUTINE_CONTROL,
            RequestDownload => service_id::REQUEST_DOWNLOAD,
            TransferBlock => service_id::TRANSFER_DATA,
            RequestTransferExit => service_id::REQUEST_TRANSFER_EXIT,
            EcuReset => service_id::ECU_RESET,
            Idle | Settle | Done => return None,
        };
        Some(sid)
    }
}
