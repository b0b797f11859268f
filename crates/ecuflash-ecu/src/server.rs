//! Bootloader protocol engine
//!
//! Every request passes through the same pipeline: session timeout check,
//! session gate, security gate, then the service handler. Handlers validate
//! the request layout themselves and answer with exactly one frame (only a
//! suppressed TesterPresent produces none).

use std::sync::Arc;

use ecuflash_proto::codec::{get_u16, get_u32};
use ecuflash_proto::transport::Transport;
use ecuflash_proto::uds::{
    communication_control, data_id, dtc_setting, negative_response, positive_response,
    reset_type, routine_id, routine_sub_function, security_sub_function, service_id,
    ADDRESS_AND_LENGTH_FORMAT, DATA_FORMAT_PLAIN, SUPPRESS_POSITIVE_RESPONSE,
};
use ecuflash_proto::{Clock, DiagnosticSession, NegativeResponseCode as Nrc};
use tracing::{debug, info, warn};

use crate::config::{EcuConfig, SequenceErrorPolicy};
use crate::security::SecurityState;
use crate::sink::SinkProvider;
use crate::transfer::{BlockOutcome, DownloadState};

/// Length format identifier: maxNumberOfBlockLength is 2 bytes
const LENGTH_FORMAT_2_BYTES: u8 = 0x20;

/// Simulated flash bootloader
pub struct EcuServer {
    config: EcuConfig,
    clock: Arc<dyn Clock>,
    sinks: Box<dyn SinkProvider>,
    session: DiagnosticSession,
    session_deadline: u64,
    security: SecurityState,
    download: DownloadState,
    dtc_setting: u8,
    communication_mode: u8,
    /// Response the link refused; sent before any new request is read
    pending_response: Option<Vec<u8>>,
    resets: u32,
}

impl EcuServer {
    pub fn new(config: EcuConfig, clock: Arc<dyn Clock>, sinks: Box<dyn SinkProvider>) -> Self {
        let security = SecurityState::new(config.security.rng_seed);
        let download = DownloadState::new(config.transfer.block_counter_wrap);
        info!(
            ecu = %config.id,
            software_version = %config.software_version,
            policy = ?config.transfer.on_sequence_error,
            verify_memory = config.transfer.verify_memory,
            "ECU bootloader ready"
        );
        Self {
            config,
            clock,
            sinks,
            session: DiagnosticSession::Default,
            session_deadline: 0,
            security,
            download,
            dtc_setting: dtc_setting::ON,
            communication_mode: communication_control::RX_ON_TX_ON,
            pending_response: None,
            resets: 0,
        }
    }

    pub fn session(&self) -> DiagnosticSession {
        self.session
    }

    pub fn is_unlocked(&self) -> bool {
        self.security.is_unlocked()
    }

    /// Seed pair the next requestSeed would hand out
    pub fn pending_seeds(&self) -> (u32, u32) {
        self.security.seeds()
    }

    pub fn security_delay_until(&self) -> u64 {
        self.security.delay_until()
    }

    pub fn expected_block(&self) -> u8 {
        self.download.expected_block()
    }

    pub fn transfer_open(&self) -> bool {
        self.download.is_open()
    }

    pub fn bytes_written(&self) -> u64 {
        self.download.bytes_written()
    }

    pub fn dtc_setting(&self) -> u8 {
        self.dtc_setting
    }

    pub fn communication_mode(&self) -> u8 {
        self.communication_mode
    }

    /// Number of hard resets performed
    pub fn reset_count(&self) -> u32 {
        self.resets
    }

    /// Receive at most one request from `transport` and answer it.
    ///
    /// Returns `true` when a request was handled. A response the link is not
    /// ready for is kept and retried on the next poll before anything new is
    /// read.
    pub fn poll(&mut self, transport: &dyn Transport) -> bool {
        if let Some(response) = self.pending_response.take() {
            if !self.send(transport, response) {
                return false;
            }
        }

        let Some(request) = transport.receive() else {
            return false;
        };
        if let Some(response) = self.handle(&request) {
            self.send(transport, response);
        }
        true
    }

    fn send(&mut self, transport: &dyn Transport, response: Vec<u8>) -> bool {
        match transport.send(&response) {
            Ok(()) => true,
            Err(e) if e.is_transient() => {
                self.pending_response = Some(response);
                false
            }
            Err(e) => {
                warn!(error = %e, "Dropping response");
                true
            }
        }
    }

    /// Process one request frame and produce the response, if any
    pub fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return Some(negative_response(0x00, Nrc::IncorrectMessageLengthOrFormat));
        };

        let now = self.clock.now_ms();
        self.check_session_timeout(now);

        if let Err(nrc) = self.check_session(sid).and_then(|_| self.check_security(sid)) {
            debug!(
                service = format!("0x{:02X}", sid),
                session = ?self.session,
                nrc = %nrc,
                "Request rejected"
            );
            return Some(negative_response(sid, nrc));
        }

        let response = match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => self.handle_session_control(request, now),
            service_id::ECU_RESET => self.handle_ecu_reset(request),
            service_id::READ_DATA_BY_ID => self.handle_read_data_by_id(request),
            service_id::SECURITY_ACCESS => self.handle_security_access(request, now),
            service_id::TESTER_PRESENT => self.handle_tester_present(request),
            service_id::CONTROL_DTC_SETTING => self.handle_control_dtc_setting(request),
            service_id::COMMUNICATION_CONTROL => self.handle_communication_control(request),
            service_id::ROUTINE_CONTROL => self.handle_routine_control(request),
            service_id::REQUEST_DOWNLOAD => self.handle_request_download(request),
            service_id::TRANSFER_DATA => self.handle_transfer_data(request),
            service_id::REQUEST_TRANSFER_EXIT => self.handle_request_transfer_exit(request),
            _ => negative_response(sid, Nrc::ServiceNotSupported),
        };

        // the restart happens once the answer is on its way
        if sid == service_id::ECU_RESET && response.first() == Some(&(sid + 0x40)) {
            self.restart();
        }

        (!response.is_empty()).then_some(response)
    }

    // ── pipeline ───────────────────────────────────────────────────────

    fn check_session_timeout(&mut self, now: u64) {
        if self.session == DiagnosticSession::Default {
            return;
        }
        if now >= self.session_deadline {
            info!(
                session = ?self.session,
                overdue_ms = now - self.session_deadline,
                "Session timeout: back to default session"
            );
            self.enter_default_session();
        } else {
            self.session_deadline = now.saturating_add(self.config.session.timeout_ms);
        }
    }

    fn check_session(&self, sid: u8) -> Result<(), Nrc> {
        match sid {
            service_id::TESTER_PRESENT
            | service_id::DIAGNOSTIC_SESSION_CONTROL
            | service_id::ECU_RESET
            | service_id::READ_DATA_BY_ID => Ok(()),
            service_id::SECURITY_ACCESS
            | service_id::CONTROL_DTC_SETTING
            | service_id::COMMUNICATION_CONTROL
            | service_id::ROUTINE_CONTROL
            | service_id::REQUEST_DOWNLOAD
            | service_id::TRANSFER_DATA
            | service_id::REQUEST_TRANSFER_EXIT => {
                if self.session == DiagnosticSession::Default {
                    Err(Nrc::ServiceNotSupportedInActiveSession)
                } else {
                    Ok(())
                }
            }
            _ => Err(Nrc::ServiceNotSupported),
        }
    }

    fn check_security(&self, sid: u8) -> Result<(), Nrc> {
        match sid {
            service_id::ROUTINE_CONTROL
            | service_id::REQUEST_DOWNLOAD
            | service_id::TRANSFER_DATA
            | service_id::REQUEST_TRANSFER_EXIT
                if !self.security.is_unlocked() =>
            {
                Err(Nrc::SecurityAccessDenied)
            }
            _ => Ok(()),
        }
    }

    /// Default session: security re-locks and any download is abandoned
    fn enter_default_session(&mut self) {
        self.session = DiagnosticSession::Default;
        if self.security.is_unlocked() {
            info!("Security access reset to locked");
        }
        self.security.lock();
        if self.download.abort() {
            warn!("Open download abandoned");
        }
    }

    fn restart(&mut self) {
        self.resets += 1;
        self.enter_default_session();
        self.dtc_setting = dtc_setting::ON;
        self.communication_mode = communication_control::RX_ON_TX_ON;
        self.download = DownloadState::new(self.config.transfer.block_counter_wrap);
        info!(resets = self.resets, "ECU restarted");
    }

    // ── services ───────────────────────────────────────────────────────

    fn handle_session_control(&mut self, request: &[u8], now: u64) -> Vec<u8> {
        const SID: u8 = service_id::DIAGNOSTIC_SESSION_CONTROL;
        if request.len() != 2 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        let Some(session) = DiagnosticSession::from_u8(request[1]) else {
            debug!(
                session = format!("0x{:02X}", request[1]),
                "Unsupported session type"
            );
            return negative_response(SID, Nrc::SubFunctionNotSupported);
        };

        if session == DiagnosticSession::Default {
            self.enter_default_session();
        } else {
            self.session = session;
        }
        self.session_deadline = now.saturating_add(self.config.session.timeout_ms);
        info!(session = format!("0x{:02X}", session.as_u8()), "Session changed");

        // [session, P2_hi, P2_lo, P2*_hi, P2*_lo], P2* in 10 ms units
        let p2 = self.config.session.p2_ms.min(u64::from(u16::MAX)) as u16;
        let p2_star = (self.config.session.p2_star_ms / 10).min(u64::from(u16::MAX)) as u16;
        let mut data = vec![session.as_u8()];
        data.extend_from_slice(&p2.to_be_bytes());
        data.extend_from_slice(&p2_star.to_be_bytes());
        positive_response(SID, &data)
    }

    fn handle_ecu_reset(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::ECU_RESET;
        if request.len() != 2 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }
        if request[1] != reset_type::HARD_RESET {
            return negative_response(SID, Nrc::ServiceNotSupported);
        }
        info!("Hard reset");
        positive_response(SID, &[reset_type::HARD_RESET])
    }

    fn handle_read_data_by_id(&self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::READ_DATA_BY_ID;
        if request.len() != 3 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        match get_u16(request, 1) {
            Some(data_id::SOFTWARE_VERSION) => {
                debug!(version = %self.config.software_version, "Read software version");
                let mut data = request[1..3].to_vec();
                data.extend_from_slice(self.config.software_version.as_bytes());
                positive_response(SID, &data)
            }
            other => {
                debug!(did = ?other.map(|d| format!("0x{:04X}", d)), "Unknown DID");
                negative_response(SID, Nrc::ServiceNotSupported)
            }
        }
    }

    fn handle_security_access(&mut self, request: &[u8], now: u64) -> Vec<u8> {
        const SID: u8 = service_id::SECURITY_ACCESS;
        if self.security.in_delay(now) {
            debug!(
                remaining_ms = self.security.delay_until() - now,
                "Security access: delay not expired"
            );
            return negative_response(SID, Nrc::RequiredTimeDelayNotExpired);
        }
        if request.len() < 2 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        match request[1] {
            security_sub_function::REQUEST_SEED => {
                if request.len() != 2 {
                    return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
                }
                let (seed_x, seed_y) = self.security.issue_seed();
                info!(
                    seed_x = format!("0x{:08X}", seed_x),
                    seed_y = format!("0x{:08X}", seed_y),
                    "Security access: providing seed"
                );
                let mut data = vec![security_sub_function::REQUEST_SEED];
                data.extend_from_slice(&seed_x.to_be_bytes());
                data.extend_from_slice(&seed_y.to_be_bytes());
                positive_response(SID, &data)
            }
            security_sub_function::SEND_KEY => {
                let Some(key) = get_u32(request, 2).filter(|_| request.len() == 6) else {
                    return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
                };
                if !self.security.has_outstanding_seed() {
                    debug!("Security access: key sent without an outstanding seed");
                    return negative_response(SID, Nrc::RequestSequenceError);
                }
                if self.security.verify_key(key, now, self.config.security.delay_ms) {
                    info!("Security access: key accepted");
                    positive_response(SID, &[security_sub_function::SEND_KEY])
                } else {
                    warn!(
                        received = format!("0x{:08X}", key),
                        delay_ms = self.config.security.delay_ms,
                        "Security access: invalid key (NRC 0x35)"
                    );
                    negative_response(SID, Nrc::InvalidKey)
                }
            }
            _ => negative_response(SID, Nrc::SubFunctionNotSupported),
        }
    }

    fn handle_tester_present(&self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::TESTER_PRESENT;
        if request.len() != 2 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        let sub_function = request[1];
        if sub_function & SUPPRESS_POSITIVE_RESPONSE != 0 {
            debug!("Tester present (suppressed response)");
            return Vec::new();
        }

        debug!("Tester present");
        positive_response(SID, &[sub_function & !SUPPRESS_POSITIVE_RESPONSE])
    }

    fn handle_control_dtc_setting(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::CONTROL_DTC_SETTING;
        if request.len() != 2 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        match request[1] {
            setting @ (dtc_setting::ON | dtc_setting::OFF) => {
                self.dtc_setting = setting;
                info!(on = setting == dtc_setting::ON, "DTC setting");
                positive_response(SID, &[setting])
            }
            _ => negative_response(SID, Nrc::SubFunctionNotSupported),
        }
    }

    fn handle_communication_control(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::COMMUNICATION_CONTROL;
        if request.len() != 3 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }
        if request[2] != communication_control::NORMAL_MESSAGES {
            return negative_response(SID, Nrc::SubFunctionNotSupported);
        }

        let mode = request[1];
        let (rx, tx) = match mode {
            communication_control::RX_ON_TX_ON => (true, true),
            communication_control::RX_ON_TX_OFF => (true, false),
            communication_control::RX_OFF_TX_ON => (false, true),
            communication_control::RX_OFF_TX_OFF => (false, false),
            _ => return negative_response(SID, Nrc::SubFunctionNotSupported),
        };
        self.communication_mode = mode;
        info!(rx, tx, "Communication control");
        positive_response(SID, &[mode])
    }

    fn handle_routine_control(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::ROUTINE_CONTROL;
        match request.get(1) {
            None => return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat),
            Some(&sub) if sub != routine_sub_function::START_ROUTINE => {
                return negative_response(SID, Nrc::SubFunctionNotSupported);
            }
            Some(_) => {}
        }
        let Some(routine) = get_u16(request, 2) else {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        };

        match routine {
            routine_id::ERASE_MEMORY => self.handle_erase_memory(request),
            routine_id::CHECK_MEMORY => self.handle_check_memory(request),
            routine_id::CHECK_PROGRAMMING_DEPENDENCY => {
                if request.len() != 4 {
                    return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
                }
                info!("Check programming dependency");
                positive_response(SID, &[0x01, 0xFF, 0x01, 0x00, 0x00, 0x00, 0x00])
            }
            _ => {
                debug!(routine = format!("0x{:04X}", routine), "Unknown routine");
                negative_response(SID, Nrc::SubFunctionNotSupported)
            }
        }
    }

    fn handle_erase_memory(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::ROUTINE_CONTROL;
        if request.len() != 13 || request[4] != ADDRESS_AND_LENGTH_FORMAT {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }
        let (Some(address), Some(size)) = (get_u32(request, 5), get_u32(request, 9)) else {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        };
        info!(
            address = format!("0x{:08X}", address),
            size,
            "Erase memory"
        );
        // [sub-function, routine id, status 0 = success]
        positive_response(SID, &[0x01, 0xFF, 0x00, 0x00])
    }

    fn handle_check_memory(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::ROUTINE_CONTROL;
        if request.len() != 18 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }
        let fields = (
            get_u32(request, 4),
            get_u32(request, 8),
            get_u16(request, 12),
            get_u32(request, 14),
        );
        let (Some(address), Some(size), Some(4), Some(crc)) = fields else {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        };

        info!(
            address = format!("0x{:08X}", address),
            size,
            crc = format!("0x{:08X}", crc),
            "Check memory"
        );

        if self.config.transfer.verify_memory && !self.download.matches(size, crc) {
            warn!(
                claimed_size = size,
                claimed_crc = format!("0x{:08X}", crc),
                written_size = self.download.bytes_written(),
                written_crc = format!("0x{:08X}", self.download.crc()),
                "Check memory: image mismatch"
            );
            return negative_response(SID, Nrc::GeneralProgrammingFailure);
        }
        positive_response(SID, &[0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00])
    }

    fn handle_request_download(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::REQUEST_DOWNLOAD;
        if request.len() != 11
            || request[1] != DATA_FORMAT_PLAIN
            || request[2] != ADDRESS_AND_LENGTH_FORMAT
        {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }
        let (Some(address), Some(size)) = (get_u32(request, 3), get_u32(request, 7)) else {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        };

        if self.download.request(address, size) {
            warn!("RequestDownload: previous transfer abandoned");
        }
        info!(
            address = format!("0x{:08X}", address),
            size,
            max_block_length = self.config.transfer.max_block_length,
            "Request download"
        );

        let mut data = vec![LENGTH_FORMAT_2_BYTES];
        data.extend_from_slice(&self.config.transfer.max_block_length.to_be_bytes());
        positive_response(SID, &data)
    }

    fn handle_transfer_data(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::TRANSFER_DATA;
        if request.len() < 3 || request.len() > usize::from(self.config.transfer.max_block_length)
        {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        let block = request[1];
        let data = &request[2..];

        if self.download.starts_new_image(block) {
            if self.download.is_open() {
                warn!("TransferData: block 1 restarts the image, discarding partial data");
            }
            match self.sinks.open() {
                Ok(sink) => self.download.begin(sink),
                Err(e) => {
                    self.download.abort();
                    warn!(error = %e, "TransferData: cannot open image sink");
                    return negative_response(SID, Nrc::GeneralProgrammingFailure);
                }
            }
        }

        match self.download.write(block, data) {
            BlockOutcome::Accepted => {
                debug!(
                    block,
                    bytes = data.len(),
                    total_written = self.download.bytes_written(),
                    "TransferData: block received"
                );
                positive_response(SID, &[block])
            }
            BlockOutcome::NotStarted => {
                debug!(block, "TransferData: no transfer in progress");
                negative_response(SID, Nrc::RequestSequenceError)
            }
            BlockOutcome::OutOfSequence { expected } => {
                debug!(
                    expected,
                    received = block,
                    "TransferData: wrong block sequence counter"
                );
                if self.config.transfer.on_sequence_error == SequenceErrorPolicy::Abort {
                    self.download.abort();
                    warn!("TransferData: transfer aborted, restart from block 1 required");
                }
                negative_response(SID, Nrc::RequestSequenceError)
            }
            BlockOutcome::WriteFailed(e) => {
                warn!(error = %e, block, "TransferData: write failed, transfer aborted");
                negative_response(SID, Nrc::GeneralProgrammingFailure)
            }
        }
    }

    fn handle_request_transfer_exit(&mut self, request: &[u8]) -> Vec<u8> {
        const SID: u8 = service_id::REQUEST_TRANSFER_EXIT;
        if request.len() != 1 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }

        if let Some((_, size)) = self.download.announced() {
            if u64::from(size) != self.download.bytes_written() {
                warn!(
                    announced = size,
                    written = self.download.bytes_written(),
                    "Request transfer exit: size differs from RequestDownload"
                );
            }
        }

        match self.download.finish() {
            Ok(closed) => {
                info!(
                    closed,
                    bytes = self.download.bytes_written(),
                    crc = format!("0x{:08X}", self.download.crc()),
                    "Request transfer exit"
                );
                positive_response(SID, &[])
            }
            Err(e) => {
                warn!(error = %e, "Request transfer exit: closing image failed");
                negative_response(SID, Nrc::GeneralProgrammingFailure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySinkProvider;
    use ecuflash_proto::{crc32, derive_key, ManualClock, CRC_SEED};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    struct Fixture {
        ecu: EcuServer,
        clock: ManualClock,
        image: MemorySinkProvider,
    }

    fn fixture_with_sink(config: EcuConfig, image: MemorySinkProvider) -> Fixture {
        let clock = ManualClock::starting_at(1_000);
        let ecu = EcuServer::new(config, Arc::new(clock.clone()), Box::new(image.clone()));
        Fixture { ecu, clock, image }
    }

    fn fixture_with(config: EcuConfig) -> Fixture {
        fixture_with_sink(config, MemorySinkProvider::new())
    }

    fn fixture() -> Fixture {
        let mut config = EcuConfig::default();
        config.security.rng_seed = Some(0x5EED);
        fixture_with(config)
    }

    impl Fixture {
        fn send(&mut self, request: &[u8]) -> Vec<u8> {
            self.ecu.handle(request).unwrap_or_default()
        }

        fn unlock(&mut self) {
            assert_eq!(self.send(&[0x10, 0x02])[0], 0x50);
            let seed = self.send(&[0x27, 0x05]);
            let x = get_u32(&seed, 2).unwrap();
            let y = get_u32(&seed, 6).unwrap();
            let mut request = vec![0x27, 0x06];
            request.extend_from_slice(&derive_key(x, y).to_be_bytes());
            assert_eq!(self.send(&request), vec![0x67, 0x06]);
        }
    }

    fn check_memory_request(size: u32, crc: u32) -> Vec<u8> {
        let mut request = vec![0x31, 0x01, 0x02, 0x00, 0x00, 0x1D, 0x00, 0x00];
        request.extend_from_slice(&size.to_be_bytes());
        request.extend_from_slice(&[0x00, 0x04]);
        request.extend_from_slice(&crc.to_be_bytes());
        request
    }

    #[test]
    fn test_empty_request() {
        let mut f = fixture();
        assert_eq!(f.send(&[]), vec![0x7F, 0x00, 0x13]);
    }

    #[test]
    fn test_unknown_service() {
        let mut f = fixture();
        assert_eq!(f.send(&[0x2E, 0xF1, 0x95, 0x00]), vec![0x7F, 0x2E, 0x11]);
        f.unlock();
        assert_eq!(f.send(&[0x19, 0x02, 0xFF]), vec![0x7F, 0x19, 0x11]);
    }

    #[test]
    fn test_session_control_response() {
        let mut f = fixture();
        assert_eq!(
            f.send(&[0x10, 0x03]),
            vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]
        );
        assert_eq!(f.ecu.session(), DiagnosticSession::Extended);
        assert_eq!(f.send(&[0x10, 0x04]), vec![0x7F, 0x10, 0x12]);
        assert_eq!(f.send(&[0x10, 0x02, 0x00]), vec![0x7F, 0x10, 0x13]);
    }

    #[rstest]
    #[case(&[0x31, 0x01, 0xFF, 0x01])]
    #[case(&[0x34, 0x00, 0x44, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10])]
    #[case(&[0x36, 0x01, 0xAA])]
    #[case(&[0x37])]
    #[case(&[0x27, 0x05])]
    #[case(&[0x85, 0x02])]
    #[case(&[0x28, 0x03, 0x01])]
    fn test_default_session_gate(#[case] request: &[u8]) {
        let mut f = fixture();
        assert_eq!(f.send(request), vec![0x7F, request[0], 0x7F]);
    }

    #[rstest]
    #[case(&[0x31, 0x01, 0xFF, 0x01])]
    #[case(&[0x34, 0x00, 0x44, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10])]
    #[case(&[0x36, 0x01, 0xAA])]
    #[case(&[0x37])]
    fn test_default_session_gate_ignores_security(#[case] request: &[u8]) {
        let mut f = fixture();
        f.unlock();
        f.send(&[0x10, 0x01]);
        assert_eq!(f.send(request), vec![0x7F, request[0], 0x7F]);
    }

    #[rstest]
    #[case(0x02, &[0x31, 0x01, 0xFF, 0x01])]
    #[case(0x02, &[0x34, 0x00, 0x44, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10])]
    #[case(0x02, &[0x36, 0x01, 0xAA])]
    #[case(0x02, &[0x37])]
    #[case(0x03, &[0x31, 0x01, 0xFF, 0x01])]
    #[case(0x03, &[0x37])]
    fn test_security_gate(#[case] session: u8, #[case] request: &[u8]) {
        let mut f = fixture();
        f.send(&[0x10, session]);
        assert_eq!(f.send(request), vec![0x7F, request[0], 0x33]);
    }

    #[rstest]
    #[case(&[0x3E, 0x00], vec![0x7E, 0x00])]
    #[case(&[0x22, 0xF1, 0x95], vec![0x62, 0xF1, 0x95, b'1', b'2', b'3', b'4'])]
    #[case(&[0x22, 0xF1, 0x90], vec![0x7F, 0x22, 0x11])]
    #[case(&[0x22, 0xF1], vec![0x7F, 0x22, 0x13])]
    #[case(&[0x11, 0x02], vec![0x7F, 0x11, 0x11])]
    #[case(&[0x11, 0x01, 0x00], vec![0x7F, 0x11, 0x13])]
    fn test_any_session_services(#[case] request: &[u8], #[case] expected: Vec<u8>) {
        let mut f = fixture();
        assert_eq!(f.send(request), expected);
    }

    #[test]
    fn test_tester_present_suppressed() {
        let mut f = fixture();
        assert_eq!(f.ecu.handle(&[0x3E, 0x80]), None);
    }

    #[test]
    fn test_dtc_and_communication_control() {
        let mut f = fixture();
        f.send(&[0x10, 0x03]);
        assert_eq!(f.send(&[0x85, 0x02]), vec![0xC5, 0x02]);
        assert_eq!(f.ecu.dtc_setting(), dtc_setting::OFF);
        assert_eq!(f.send(&[0x85, 0x03]), vec![0x7F, 0x85, 0x12]);

        assert_eq!(f.send(&[0x28, 0x03, 0x01]), vec![0x68, 0x03]);
        assert_eq!(f.ecu.communication_mode(), 0x03);
        assert_eq!(f.send(&[0x28, 0x03, 0x02]), vec![0x7F, 0x28, 0x12]);
        assert_eq!(f.send(&[0x28, 0x04, 0x01]), vec![0x7F, 0x28, 0x12]);
        assert_eq!(f.send(&[0x28, 0x03]), vec![0x7F, 0x28, 0x13]);
    }

    #[test]
    fn test_security_unlock() {
        let mut f = fixture();
        f.unlock();
        assert!(f.ecu.is_unlocked());
        assert_eq!(f.ecu.pending_seeds(), (0, 0));
        // unlocked ECUs hand out a zero seed
        assert_eq!(
            f.send(&[0x27, 0x05]),
            vec![0x67, 0x05, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(f.send(&[0x27, 0x06, 0, 0, 0, 0]), vec![0x7F, 0x27, 0x24]);
    }

    #[test]
    fn test_security_access_format_errors() {
        let mut f = fixture();
        f.send(&[0x10, 0x03]);
        assert_eq!(f.send(&[0x27]), vec![0x7F, 0x27, 0x13]);
        assert_eq!(f.send(&[0x27, 0x05, 0x00]), vec![0x7F, 0x27, 0x13]);
        assert_eq!(f.send(&[0x27, 0x06, 0x00]), vec![0x7F, 0x27, 0x13]);
        assert_eq!(f.send(&[0x27, 0x01]), vec![0x7F, 0x27, 0x12]);
    }

    #[test]
    fn test_invalid_key_delay_window() {
        let mut f = fixture();
        f.send(&[0x10, 0x03]);

        for attempt in 0..2 {
            let seeds_before = f.ecu.pending_seeds();
            let seed = f.send(&[0x27, 0x05]);
            assert_eq!(seed[0], 0x67, "attempt {attempt}");
            assert_eq!(f.send(&[0x27, 0x06, 0, 0, 0, 1]), vec![0x7F, 0x27, 0x35]);
            assert_ne!(f.ecu.pending_seeds(), seeds_before);
            assert_eq!(f.ecu.security_delay_until(), f.clock.now_ms() + 10_000);

            // tester present keeps the extended session alive through the window
            for _ in 0..3 {
                f.clock.advance(3_333);
                assert_eq!(f.send(&[0x3E, 0x00]), vec![0x7E, 0x00]);
            }
            assert_eq!(f.send(&[0x27, 0x05]), vec![0x7F, 0x27, 0x37]);
            f.clock.advance(1);
        }
    }

    #[test]
    fn test_session_timeout_relocks() {
        let mut f = fixture();
        f.unlock();
        f.clock.advance(4_999);
        assert_eq!(f.send(&[0x3E, 0x00]), vec![0x7E, 0x00]);
        assert_eq!(f.ecu.session(), DiagnosticSession::Programming);

        // the deadline was renewed by the tester present
        f.clock.advance(5_000);
        assert_eq!(f.send(&[0x37]), vec![0x7F, 0x37, 0x7F]);
        assert_eq!(f.ecu.session(), DiagnosticSession::Default);
        assert!(!f.ecu.is_unlocked());
        assert_ne!(f.ecu.pending_seeds(), (0, 0));
    }

    #[test]
    fn test_unbounded_session_timeout() {
        let mut config = EcuConfig::from_yaml("session:\n  timeout_ms: 18446744073709551615\n").unwrap();
        config.security.rng_seed = Some(0x5EED);
        let mut f = fixture_with(config);

        assert_eq!(&f.send(&[0x10, 0x03])[..2], &[0x50, 0x03]);
        f.clock.advance(1_000_000);
        assert_eq!(f.send(&[0x3E, 0x00]), vec![0x7E, 0x00]);
        assert_eq!(f.ecu.session(), DiagnosticSession::Extended);
    }

    #[test]
    fn test_default_session_relocks() {
        let mut f = fixture();
        f.unlock();
        f.send(&[0x10, 0x01]);
        f.send(&[0x10, 0x02]);
        assert!(!f.ecu.is_unlocked());
        assert_eq!(f.send(&[0x37]), vec![0x7F, 0x37, 0x33]);
    }

    #[test]
    fn test_routine_control_layouts() {
        let mut f = fixture();
        f.unlock();
        let erase = [0x31, 0x01, 0xFF, 0x00, 0x44, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x00, 0x09, 0xC4];
        assert_eq!(f.send(&erase), vec![0x71, 0x01, 0xFF, 0x00, 0x00]);

        let mut bad_format = erase;
        bad_format[4] = 0x33;
        assert_eq!(f.send(&bad_format), vec![0x7F, 0x31, 0x13]);
        assert_eq!(f.send(&erase[..12]), vec![0x7F, 0x31, 0x13]);

        assert_eq!(
            f.send(&[0x31, 0x01, 0xFF, 0x01]),
            vec![0x71, 0x01, 0xFF, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(f.send(&[0x31, 0x01, 0xFF, 0x01, 0x00]), vec![0x7F, 0x31, 0x13]);
        assert_eq!(f.send(&[0x31, 0x02, 0xFF, 0x01]), vec![0x7F, 0x31, 0x12]);
        assert_eq!(f.send(&[0x31, 0x01, 0x12, 0x34]), vec![0x7F, 0x31, 0x12]);
        assert_eq!(f.send(&[0x31, 0x01, 0xFF]), vec![0x7F, 0x31, 0x13]);
        assert_eq!(f.send(&[0x31, 0x02]), vec![0x7F, 0x31, 0x12]);
        assert_eq!(f.send(&[0x31]), vec![0x7F, 0x31, 0x13]);

        let mut bad_crc_len = check_memory_request(0, CRC_SEED);
        bad_crc_len[13] = 0x02;
        assert_eq!(f.send(&bad_crc_len), vec![0x7F, 0x31, 0x13]);
    }

    #[test]
    fn test_request_download_response() {
        let mut f = fixture();
        f.unlock();
        let request = [0x34, 0x00, 0x44, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x00, 0x09, 0xC4];
        assert_eq!(f.send(&request), vec![0x74, 0x20, 0x0F, 0x02]);

        let mut compressed = request;
        compressed[1] = 0x11;
        assert_eq!(f.send(&compressed), vec![0x7F, 0x34, 0x13]);
        assert_eq!(f.send(&request[..10]), vec![0x7F, 0x34, 0x13]);
    }

    #[test]
    fn test_transfer_and_verify() {
        let mut f = fixture();
        f.unlock();
        let image: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();

        for (i, block) in image.chunks(1024).enumerate() {
            let seq = (i + 1) as u8;
            let mut request = vec![0x36, seq];
            request.extend_from_slice(block);
            assert_eq!(f.send(&request), vec![0x76, seq]);
        }
        assert_eq!(f.send(&[0x37]), vec![0x77]);
        assert!(f.image.is_finished());
        assert_eq!(f.image.contents(), image);

        let crc = crc32(CRC_SEED, &image);
        assert_eq!(
            f.send(&check_memory_request(2500, crc)),
            vec![0x71, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            f.send(&check_memory_request(2500, crc ^ 1)),
            vec![0x7F, 0x31, 0x72]
        );
        assert_eq!(
            f.send(&check_memory_request(2499, crc)),
            vec![0x7F, 0x31, 0x72]
        );
    }

    #[test]
    fn test_check_memory_stub_when_verification_disabled() {
        let mut config = EcuConfig::default();
        config.transfer.verify_memory = false;
        let mut f = fixture_with(config);
        f.unlock();
        assert_eq!(
            f.send(&check_memory_request(1234, 0xDEAD_BEEF)),
            vec![0x71, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sequence_error_resume() {
        let mut f = fixture();
        f.unlock();
        assert_eq!(f.send(&[0x36, 0x01, 0xAA]), vec![0x76, 0x01]);
        assert_eq!(f.send(&[0x36, 0x03, 0xCC]), vec![0x7F, 0x36, 0x24]);
        assert_eq!(f.ecu.expected_block(), 2);
        assert!(f.ecu.transfer_open());
        assert_eq!(f.image.contents(), vec![0xAA]);

        assert_eq!(f.send(&[0x36, 0x02, 0xBB]), vec![0x76, 0x02]);
        assert_eq!(f.image.contents(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_sequence_error_abort() {
        let mut config = EcuConfig::default();
        config.transfer.on_sequence_error = SequenceErrorPolicy::Abort;
        let mut f = fixture_with(config);
        f.unlock();
        assert_eq!(f.send(&[0x36, 0x01, 0xAA]), vec![0x76, 0x01]);
        assert_eq!(f.send(&[0x36, 0x03, 0xCC]), vec![0x7F, 0x36, 0x24]);
        assert!(!f.ecu.transfer_open());
        assert_eq!(f.send(&[0x36, 0x02, 0xBB]), vec![0x7F, 0x36, 0x24]);

        assert_eq!(f.send(&[0x36, 0x01, 0x11]), vec![0x76, 0x01]);
        assert_eq!(f.image.contents(), vec![0x11]);
        assert_eq!(f.image.open_count(), 2);
    }

    #[test]
    fn test_block_without_transfer() {
        let mut f = fixture();
        f.unlock();
        assert_eq!(f.send(&[0x36, 0x02, 0xAA]), vec![0x7F, 0x36, 0x24]);
        assert_eq!(f.send(&[0x36, 0x02]), vec![0x7F, 0x36, 0x13]);
        // exit without an open sink is still acknowledged
        assert_eq!(f.send(&[0x37]), vec![0x77]);
        assert_eq!(f.send(&[0x37, 0x00]), vec![0x7F, 0x37, 0x13]);
    }

    #[test]
    fn test_block_one_restarts_image() {
        let mut f = fixture();
        f.unlock();
        f.send(&[0x36, 0x01, 0xAA]);
        f.send(&[0x36, 0x02, 0xBB]);
        assert_eq!(f.send(&[0x36, 0x01, 0xCC]), vec![0x76, 0x01]);
        assert_eq!(f.image.contents(), vec![0xCC]);
        assert_eq!(f.ecu.expected_block(), 2);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let mut config = EcuConfig::default();
        config.transfer.max_block_length = 8;
        let mut f = fixture_with(config);
        f.unlock();
        assert_eq!(f.send(&[0x36, 0x01, 1, 2, 3, 4, 5, 6]), vec![0x76, 0x01]);
        assert_eq!(
            f.send(&[0x36, 0x02, 1, 2, 3, 4, 5, 6, 7]),
            vec![0x7F, 0x36, 0x13]
        );
    }

    #[test]
    fn test_sink_write_failure() {
        let mut f = fixture_with_sink(
            EcuConfig::default(),
            MemorySinkProvider::with_capacity_limit(2),
        );
        f.unlock();
        assert_eq!(f.send(&[0x36, 0x01, 1, 2, 3]), vec![0x7F, 0x36, 0x72]);
        assert!(!f.ecu.transfer_open());
        assert_eq!(f.send(&[0x36, 0x02, 4]), vec![0x7F, 0x36, 0x24]);
    }

    #[test]
    fn test_ecu_reset_restarts() {
        let mut f = fixture();
        f.unlock();
        f.send(&[0x36, 0x01, 0xAA]);
        assert_eq!(f.send(&[0x11, 0x01]), vec![0x51, 0x01]);
        assert_eq!(f.ecu.session(), DiagnosticSession::Default);
        assert!(!f.ecu.is_unlocked());
        assert!(!f.ecu.transfer_open());
        assert_eq!(f.ecu.reset_count(), 1);
        assert_eq!(f.ecu.dtc_setting(), dtc_setting::ON);
    }

    #[test]
    fn test_poll_holds_response_while_link_busy() {
        use ecuflash_proto::{LoopbackLink, Transport as _};

        let mut f = fixture();
        let (tester, ecu_end) = LoopbackLink::pair();

        tester.send(&[0x3E, 0x00]).unwrap();
        assert!(f.ecu.poll(&ecu_end));
        tester.send(&[0x22, 0xF1, 0x95]).unwrap();
        // previous response not collected yet
        assert!(f.ecu.poll(&ecu_end));
        assert!(!f.ecu.poll(&ecu_end));

        assert_eq!(tester.receive(), Some(vec![0x7E, 0x00]));
        assert!(!f.ecu.poll(&ecu_end));
        assert_eq!(tester.receive().map(|r| r[0]), Some(0x62));
    }
}
