//! Tick-driven flash sequence
//!
//! Each step goes through the same phases: the request is issued, then the
//! orchestrator waits for the matching response or the response deadline.
//! Every tick performs at most one receive and one transition, so the
//! orchestrator can share a thread (or a loop) with the ECU it talks to.

use std::path::Path;
use std::sync::Arc;

use ecuflash_proto::codec::{get_u16, get_u32, put_u16, put_u32};
use ecuflash_proto::uds::{
    communication_control, data_id, dtc_setting, reset_type, routine_id, routine_sub_function,
    security_sub_function, service_id, ADDRESS_AND_LENGTH_FORMAT, DATA_FORMAT_PLAIN,
};
use ecuflash_proto::{
    derive_key, Clock, DiagnosticSession, NegativeResponseCode, Transport, UdsResponse,
};
use tracing::{debug, info, trace, warn};

use crate::config::FlashConfig;
use crate::error::{FlashError, Result};
use crate::image::FirmwareImage;
use crate::job::{AbortReason, FlashJob, JobOutcome, JobReport};
use crate::step::FlashStep;

/// P2* assumed until a session response announces the real value
const DEFAULT_P2_STAR_MS: u64 = 5_000;

/// Length of the CRC carried by CheckMemory
const CRC_LENGTH: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The step's request has not been sent yet
    Issue,
    /// Request sent, waiting for `service` to answer before `deadline`
    Awaiting { service: u8, deadline: u64 },
    /// Nothing outstanding, move on at `until`
    Settling { until: u64 },
}

/// Drives one ECU through a complete firmware update
pub struct FlashOrchestrator {
    config: FlashConfig,
    clock: Arc<dyn Clock>,
    step: FlashStep,
    phase: Phase,
    job: Option<FlashJob>,
    /// Most recent classified response, consumed by the awaiting phase
    last_response: Option<UdsResponse>,
    p2_star_ms: u64,
    block_size: usize,
    key: u32,
    /// The ECU handed out a zero seed: it is unlocked already
    already_unlocked: bool,
    /// Payload length of the TransferData block awaiting its ack
    in_flight: usize,
    software_version: Option<String>,
    started_at: u64,
    report: Option<JobReport>,
}

impl FlashOrchestrator {
    pub fn new(config: FlashConfig, clock: Arc<dyn Clock>) -> Self {
        let block_size = config.block_size;
        Self {
            config,
            clock,
            step: FlashStep::Idle,
            phase: Phase::Issue,
            job: None,
            last_response: None,
            p2_star_ms: DEFAULT_P2_STAR_MS,
            block_size,
            key: 0,
            already_unlocked: false,
            in_flight: 0,
            software_version: None,
            started_at: 0,
            report: None,
        }
    }

    pub fn step(&self) -> FlashStep {
        self.step
    }

    pub fn is_idle(&self) -> bool {
        self.step == FlashStep::Idle
    }

    /// Whether the current job has finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.job.as_ref().is_some_and(FlashJob::is_done)
    }

    pub fn job(&self) -> Option<&FlashJob> {
        self.job.as_ref()
    }

    /// Report of the last finished job
    pub fn report(&self) -> Option<&JobReport> {
        self.report.as_ref()
    }

    /// TransferData payload size in effect for the current job
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Begin flashing `image`. Only allowed while idle.
    pub fn start(&mut self, image: FirmwareImage) -> Result<()> {
        if !self.is_idle() {
            return Err(FlashError::Busy(self.step));
        }

        info!(
            len = image.len(),
            crc = format!("0x{:08X}", image.crc()),
            address = format!("0x{:08X}", self.config.start_address),
            "Starting flash job"
        );
        self.job = Some(FlashJob::new(
            image,
            self.config.start_address,
            self.config.block_counter_wrap,
        ));
        self.step = FlashStep::EnterDefaultSession;
        self.phase = Phase::Issue;
        self.last_response = None;
        self.p2_star_ms = DEFAULT_P2_STAR_MS;
        self.block_size = self.config.block_size;
        self.key = 0;
        self.already_unlocked = false;
        self.in_flight = 0;
        self.software_version = None;
        self.started_at = self.clock.now_ms();
        self.report = None;
        Ok(())
    }

    /// Load the image at `path` and begin flashing it
    pub fn start_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !self.is_idle() {
            return Err(FlashError::Busy(self.step));
        }
        let image = FirmwareImage::load(path)?;
        self.start(image)
    }

    /// One scheduling step: take a response if one arrived, then advance
    pub fn tick(&mut self, transport: &dyn Transport) {
        self.poll(transport);
        self.advance(transport);
    }

    /// Receive at most one frame into the response slot
    pub fn poll(&mut self, transport: &dyn Transport) -> bool {
        let Some(frame) = transport.receive() else {
            return false;
        };
        match UdsResponse::parse(&frame) {
            Some(response) => {
                trace!(?response, "Response received");
                self.last_response = Some(response);
                true
            }
            None => {
                warn!(frame = format!("{:02X?}", frame), "Discarding malformed response");
                false
            }
        }
    }

    /// Perform at most one transition of the current step
    pub fn advance(&mut self, transport: &dyn Transport) {
        match self.step {
            FlashStep::Idle => return,
            FlashStep::Done => {
                self.finish(JobOutcome::Completed);
                return;
            }
            _ => {}
        }

        let now = self.clock.now_ms();
        match self.phase {
            Phase::Issue => self.issue(transport, now),
            Phase::Awaiting { service, deadline } => self.await_response(service, deadline, now),
            Phase::Settling { until } => {
                if now >= until {
                    self.step_forward();
                }
            }
        }
    }

    // ── phases ─────────────────────────────────────────────────────────

    fn issue(&mut self, transport: &dyn Transport, now: u64) {
        if self.step == FlashStep::Settle {
            debug!(settle_ms = self.config.timeouts.settle_ms, "Waiting before unlock");
            self.phase = Phase::Settling {
                until: now.saturating_add(self.config.timeouts.settle_ms),
            };
            return;
        }

        let Some(request) = self.build_request() else {
            self.abort(AbortReason::InvalidResponse {
                step: self.step,
                detail: "no request for this step".into(),
            });
            return;
        };

        self.last_response = None;
        match transport.send(&request) {
            Ok(()) => {
                debug!(
                    step = ?self.step,
                    service = format!("0x{:02X}", request[0]),
                    len = request.len(),
                    "Request sent"
                );
                self.phase = Phase::Awaiting {
                    service: request[0],
                    deadline: now.saturating_add(self.config.timeouts.response_ms),
                };
            }
            Err(e) if e.is_transient() => {
                trace!(step = ?self.step, "Link busy, retrying next tick");
            }
            Err(e) => self.abort(AbortReason::Transport {
                step: self.step,
                error: e.to_string(),
            }),
        }
    }

    fn await_response(&mut self, service: u8, deadline: u64, now: u64) {
        if let Some(response) = self.last_response.take() {
            match response {
                UdsResponse::Negative { service: s, nrc } if s == service => {
                    if nrc == NegativeResponseCode::ResponsePending {
                        debug!(step = ?self.step, p2_star_ms = self.p2_star_ms, "Response pending");
                        self.phase = Phase::Awaiting {
                            service,
                            deadline: now.saturating_add(self.p2_star_ms),
                        };
                        return;
                    }
                    warn!(
                        step = ?self.step,
                        service = format!("0x{:02X}", service),
                        nrc = %nrc,
                        "Negative response"
                    );
                    self.abort(AbortReason::Negative {
                        step: self.step,
                        service,
                        nrc,
                    });
                    return;
                }
                UdsResponse::Positive { service: s, data } if s == service => {
                    match self.consume(&data) {
                        Ok(()) => self.step_forward(),
                        Err(detail) => self.abort(AbortReason::InvalidResponse {
                            step: self.step,
                            detail,
                        }),
                    }
                    return;
                }
                other => {
                    warn!(
                        step = ?self.step,
                        expected = format!("0x{:02X}", service),
                        received = format!("0x{:02X}", other.service()),
                        "Ignoring response for another service"
                    );
                }
            }
        }

        if now >= deadline {
            warn!(
                step = ?self.step,
                timeout_ms = self.config.timeouts.response_ms,
                "No response"
            );
            self.abort(AbortReason::Timeout { step: self.step });
        }
    }

    fn step_forward(&mut self) {
        let more_blocks = self.job.as_ref().is_some_and(FlashJob::has_more);
        let mut next = self.step.next(more_blocks);
        if self.step == FlashStep::RequestSeed && self.already_unlocked {
            info!("ECU already unlocked, skipping key");
            next = FlashStep::EraseMemory;
        }
        debug!(from = ?self.step, to = ?next, "Step complete");
        self.step = next;
        self.phase = Phase::Issue;
    }

    fn abort(&mut self, reason: AbortReason) {
        warn!(reason = %reason, "Flash job aborted");
        self.finish(JobOutcome::Aborted(reason));
    }

    fn finish(&mut self, outcome: JobOutcome) {
        let now = self.clock.now_ms();
        if let Some(job) = self.job.as_mut() {
            job.finish();
            let report = JobReport {
                outcome,
                software_version: self.software_version.clone(),
                blocks_sent: job.blocks_sent(),
                bytes_sent: job.bytes_sent() as u64,
                image_len: job.image().len() as u64,
                image_crc: job.image().crc(),
                elapsed_ms: now.saturating_sub(self.started_at),
            };
            if report.is_completed() {
                info!(
                    blocks = report.blocks_sent,
                    bytes = report.bytes_sent,
                    elapsed_ms = report.elapsed_ms,
                    "Flash job completed"
                );
            }
            self.report = Some(report);
        }
        self.step = FlashStep::Idle;
        self.phase = Phase::Issue;
        self.last_response = None;
    }

    // ── requests ───────────────────────────────────────────────────────

    fn build_request(&mut self) -> Option<Vec<u8>> {
        let job = self.job.as_ref()?;
        let address = job.start_address();
        let len = job.image().len_u32();

        let mut request = vec![self.step.service()?];
        match self.step {
            FlashStep::EnterDefaultSession => request.push(DiagnosticSession::Default.as_u8()),
            FlashStep::EnterExtendedSession | FlashStep::ReenterExtendedSession => {
                request.push(DiagnosticSession::Extended.as_u8())
            }
            FlashStep::EnterProgrammingSession => {
                request.push(DiagnosticSession::Programming.as_u8())
            }
            FlashStep::ReadSoftwareVersion => put_u16(&mut request, data_id::SOFTWARE_VERSION),
            FlashStep::DisableDtcSetting => request.push(dtc_setting::OFF),
            FlashStep::DisableCommunication => request.extend_from_slice(&[
                communication_control::RX_OFF_TX_OFF,
                communication_control::NORMAL_MESSAGES,
            ]),
            FlashStep::RequestSeed => request.push(security_sub_function::REQUEST_SEED),
            FlashStep::SendKey => {
                request.push(security_sub_function::SEND_KEY);
                put_u32(&mut request, self.key);
            }
            FlashStep::EraseMemory => {
                request.push(routine_sub_function::START_ROUTINE);
                put_u16(&mut request, routine_id::ERASE_MEMORY);
                request.push(ADDRESS_AND_LENGTH_FORMAT);
                put_u32(&mut request, address);
                put_u32(&mut request, len);
            }
            FlashStep::RequestDownload => {
                request.extend_from_slice(&[DATA_FORMAT_PLAIN, ADDRESS_AND_LENGTH_FORMAT]);
                put_u32(&mut request, address);
                put_u32(&mut request, len);
            }
            FlashStep::TransferBlock => {
                let chunk = job.chunk(self.block_size);
                request.push(job.next_block());
                request.extend_from_slice(chunk);
                self.in_flight = chunk.len();
            }
            FlashStep::RequestTransferExit => {}
            FlashStep::CheckMemory => {
                request.push(routine_sub_function::START_ROUTINE);
                put_u16(&mut request, routine_id::CHECK_MEMORY);
                put_u32(&mut request, address);
                put_u32(&mut request, len);
                put_u16(&mut request, CRC_LENGTH);
                put_u32(&mut request, job.image().crc());
            }
            FlashStep::CheckProgDependency => {
                request.push(routine_sub_function::START_ROUTINE);
                put_u16(&mut request, routine_id::CHECK_PROGRAMMING_DEPENDENCY);
            }
            FlashStep::EcuReset => request.push(reset_type::HARD_RESET),
            FlashStep::Idle | FlashStep::Settle | FlashStep::Done => return None,
        }
        Some(request)
    }

    // ── responses ──────────────────────────────────────────────────────

    /// Take what the step needs from a positive response payload
    fn consume(&mut self, data: &[u8]) -> std::result::Result<(), String> {
        match self.step {
            FlashStep::EnterDefaultSession => self.consume_session(data, DiagnosticSession::Default),
            FlashStep::EnterExtendedSession | FlashStep::ReenterExtendedSession => {
                self.consume_session(data, DiagnosticSession::Extended)
            }
            FlashStep::EnterProgrammingSession => {
                self.consume_session(data, DiagnosticSession::Programming)
            }
            FlashStep::ReadSoftwareVersion => {
                if get_u16(data, 0) != Some(data_id::SOFTWARE_VERSION) {
                    return Err("software version DID not echoed".into());
                }
                let version = String::from_utf8_lossy(&data[2..]).into_owned();
                info!(version = %version, "ECU software version");
                self.software_version = Some(version);
                Ok(())
            }
            FlashStep::RequestSeed => {
                if data.first() != Some(&security_sub_function::REQUEST_SEED) {
                    return Err("seed response without requestSeed echo".into());
                }
                let (Some(seed_x), Some(seed_y)) = (get_u32(data, 1), get_u32(data, 5)) else {
                    return Err(format!("seed response of {} bytes is too short", data.len()));
                };
                self.already_unlocked = seed_x == 0 && seed_y == 0;
                self.key = derive_key(seed_x, seed_y);
                debug!(
                    seed_x = format!("0x{:08X}", seed_x),
                    seed_y = format!("0x{:08X}", seed_y),
                    key = format!("0x{:08X}", self.key),
                    "Seed received"
                );
                Ok(())
            }
            FlashStep::SendKey => {
                if data.first() != Some(&security_sub_function::SEND_KEY) {
                    return Err("key response without sendKey echo".into());
                }
                info!("Security access granted");
                Ok(())
            }
            FlashStep::EraseMemory => expect_routine_success(data, routine_id::ERASE_MEMORY),
            FlashStep::RequestDownload => self.consume_download(data),
            FlashStep::TransferBlock => self.consume_block_ack(data),
            FlashStep::CheckMemory => expect_routine_success(data, routine_id::CHECK_MEMORY),
            FlashStep::CheckProgDependency => {
                expect_routine_success(data, routine_id::CHECK_PROGRAMMING_DEPENDENCY)
            }
            FlashStep::DisableDtcSetting
            | FlashStep::DisableCommunication
            | FlashStep::RequestTransferExit
            | FlashStep::EcuReset
            | FlashStep::Idle
            | FlashStep::Settle
            | FlashStep::Done => Ok(()),
        }
    }

    fn consume_session(
        &mut self,
        data: &[u8],
        expected: DiagnosticSession,
    ) -> std::result::Result<(), String> {
        if data.first() != Some(&expected.as_u8()) {
            return Err(format!("session response does not confirm {:?}", expected));
        }
        // [session, P2 (ms), P2* (10 ms units)]
        if let (Some(p2), Some(p2_star)) = (get_u16(data, 1), get_u16(data, 3)) {
            self.p2_star_ms = u64::from(p2_star) * 10;
            debug!(session = ?expected, p2_ms = p2, p2_star_ms = self.p2_star_ms, "Session timing");
        }
        Ok(())
    }

    fn consume_download(&mut self, data: &[u8]) -> std::result::Result<(), String> {
        // [lengthFormatIdentifier, maxNumberOfBlockLength (n bytes)]
        let Some(&format) = data.first() else {
            return Err("empty download response".into());
        };
        let width = usize::from(format >> 4);
        if width == 0 || width > 4 || data.len() < 1 + width {
            return Err(format!("bad length format 0x{:02X}", format));
        }
        let max_block_length = data[1..=width]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        if max_block_length <= 2 {
            return Err(format!("max block length {} leaves no room for data", max_block_length));
        }

        self.block_size = self.config.block_size.min(max_block_length - 2);
        info!(
            max_block_length,
            block_size = self.block_size,
            "Download accepted"
        );
        Ok(())
    }

    fn consume_block_ack(&mut self, data: &[u8]) -> std::result::Result<(), String> {
        let Some(job) = self.job.as_mut() else {
            return Err("no job".into());
        };
        let sent = job.next_block();
        if let Some(&echoed) = data.first() {
            if echoed != sent {
                return Err(format!("block {} acknowledged as {}", sent, echoed));
            }
        }
        job.acknowledge(self.in_flight);
        debug!(
            block = sent,
            bytes = self.in_flight,
            sent = job.bytes_sent(),
            total = job.image().len(),
            "Block acknowledged"
        );
        self.in_flight = 0;
        Ok(())
    }
}

/// Routine responses echo `[startRoutine, id_hi, id_lo]` and follow with
/// status bytes that are all zero on success
fn expect_routine_success(data: &[u8], routine: u16) -> std::result::Result<(), String> {
    if data.first() != Some(&routine_sub_function::START_ROUTINE) || get_u16(data, 1) != Some(routine)
    {
        return Err(format!("routine 0x{:04X} not echoed", routine));
    }
    if data[3..].iter().any(|&b| b != 0) {
        return Err(format!(
            "routine 0x{:04X} reported status {:02X?}",
            routine,
            &data[3..]
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecuflash_proto::{LoopbackEndpoint, LoopbackLink, ManualClock};
    use pretty_assertions::assert_eq;

    struct Bench {
        orch: FlashOrchestrator,
        clock: ManualClock,
        tester: LoopbackEndpoint,
        ecu: LoopbackEndpoint,
    }

    impl Bench {
        fn new(config: FlashConfig) -> Self {
            let clock = ManualClock::starting_at(10_000);
            let (tester, ecu) = LoopbackLink::pair();
            let orch = FlashOrchestrator::new(config, Arc::new(clock.clone()));
            Self {
                orch,
                clock,
                tester,
                ecu,
            }
        }

        fn started(len: usize) -> Self {
            let mut bench = Self::new(FlashConfig::default());
            let image = FirmwareImage::from_bytes(vec![0xA5; len]).unwrap();
            bench.orch.start(image).unwrap();
            bench
        }

        fn tick(&mut self) {
            self.orch.tick(&self.tester);
        }

        /// Tick once and return what reached the ECU
        fn expect_request(&mut self) -> Vec<u8> {
            self.tick();
            self.ecu.receive().expect("no request issued")
        }

        /// Deliver an ECU response and let the orchestrator consume it
        fn reply(&mut self, frame: &[u8]) {
            self.ecu.send(frame).unwrap();
            self.tick();
        }

        fn reason(&self) -> Option<AbortReason> {
            self.orch.report().and_then(|r| r.abort_reason().cloned())
        }
    }

    #[test]
    fn test_scripted_unlock() {
        let mut b = Bench::started(16);

        assert_eq!(b.expect_request(), vec![0x10, 0x01]);
        b.reply(&[0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(b.expect_request(), vec![0x22, 0xF1, 0x95]);
        b.reply(&[0x62, 0xF1, 0x95, b'4', b'2']);
        assert_eq!(b.expect_request(), vec![0x10, 0x03]);
        b.reply(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(b.expect_request(), vec![0x85, 0x02]);
        b.reply(&[0xC5, 0x02]);
        assert_eq!(b.expect_request(), vec![0x28, 0x03, 0x01]);
        b.reply(&[0x68, 0x03]);
        assert_eq!(b.expect_request(), vec![0x10, 0x02]);
        b.reply(&[0x50, 0x02, 0x00, 0x32, 0x01, 0xF4]);

        // settle: nothing goes out for 1500 ms
        b.tick();
        assert_eq!(b.orch.step(), FlashStep::Settle);
        b.clock.advance(1_499);
        b.tick();
        assert_eq!(b.ecu.receive(), None);
        b.clock.advance(1);
        b.tick();
        assert_eq!(b.orch.step(), FlashStep::RequestSeed);

        assert_eq!(b.expect_request(), vec![0x27, 0x05]);
        let (x, y) = (0x1234_5678u32, 0x9ABC_DEF0u32);
        let mut seed = vec![0x67, 0x05];
        seed.extend_from_slice(&x.to_be_bytes());
        seed.extend_from_slice(&y.to_be_bytes());
        b.reply(&seed);

        let mut key = vec![0x27, 0x06];
        key.extend_from_slice(&derive_key(x, y).to_be_bytes());
        assert_eq!(b.expect_request(), key);
        b.reply(&[0x67, 0x06]);
        assert_eq!(b.orch.step(), FlashStep::EraseMemory);

        assert_eq!(
            b.expect_request(),
            vec![0x31, 0x01, 0xFF, 0x00, 0x44, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10]
        );
    }

    #[test]
    fn test_zero_seed_skips_key() {
        let mut b = Bench::started(4);
        b.orch.step = FlashStep::RequestSeed;
        assert_eq!(b.expect_request(), vec![0x27, 0x05]);
        b.reply(&[0x67, 0x05, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(b.orch.step(), FlashStep::EraseMemory);
    }

    #[test]
    fn test_start_while_running_is_busy() {
        let mut b = Bench::started(4);
        let image = FirmwareImage::from_bytes(vec![1]).unwrap();
        assert!(matches!(
            b.orch.start(image),
            Err(FlashError::Busy(FlashStep::EnterDefaultSession))
        ));
    }

    #[test]
    fn test_timeout_aborts_once() {
        let mut b = Bench::started(4);
        b.expect_request();
        b.clock.advance(999);
        b.tick();
        assert!(!b.orch.is_done());

        b.clock.advance(1);
        b.tick();
        assert!(b.orch.is_done());
        assert!(b.orch.is_idle());
        assert_eq!(
            b.reason(),
            Some(AbortReason::Timeout {
                step: FlashStep::EnterDefaultSession
            })
        );

        // a late answer changes nothing
        b.ecu.send(&[0x50, 0x01]).unwrap();
        b.clock.advance(5_000);
        b.tick();
        b.tick();
        assert!(b.orch.is_idle());
        assert_eq!(b.ecu.receive(), None);
    }

    #[test]
    fn test_unbounded_response_timeout() {
        let config = FlashConfig::builder()
            .response_timeout_ms(u64::MAX)
            .build()
            .unwrap();
        let mut b = Bench::new(config);
        b.orch.start(FirmwareImage::from_bytes(vec![0xA5; 4]).unwrap()).unwrap();

        assert_eq!(b.expect_request(), vec![0x10, 0x01]);
        b.clock.advance(1_000_000);
        b.tick();
        assert!(!b.orch.is_done());

        b.reply(&[0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(b.orch.step(), FlashStep::ReadSoftwareVersion);
    }

    #[test]
    fn test_response_pending_extends_deadline() {
        let mut b = Bench::started(4);
        b.expect_request();
        b.clock.advance(900);
        b.reply(&[0x7F, 0x10, 0x78]);

        b.clock.advance(4_999);
        b.tick();
        assert!(!b.orch.is_done());

        b.reply(&[0x50, 0x01]);
        assert_eq!(b.orch.step(), FlashStep::ReadSoftwareVersion);
    }

    #[test]
    fn test_negative_response_aborts() {
        let mut b = Bench::started(4);
        b.expect_request();
        b.reply(&[0x7F, 0x10, 0x22]);
        assert_eq!(
            b.reason(),
            Some(AbortReason::Negative {
                step: FlashStep::EnterDefaultSession,
                service: 0x10,
                nrc: NegativeResponseCode::ConditionsNotCorrect,
            })
        );
    }

    #[test]
    fn test_other_service_response_ignored() {
        let mut b = Bench::started(4);
        b.expect_request();
        b.reply(&[0x7E, 0x00]);
        b.reply(&[0x7F, 0x22, 0x31]);
        assert_eq!(b.orch.step(), FlashStep::EnterDefaultSession);
        assert!(!b.orch.is_done());

        b.reply(&[0x50, 0x01]);
        assert_eq!(b.orch.step(), FlashStep::ReadSoftwareVersion);
    }

    #[test]
    fn test_busy_link_retries() {
        let mut b = Bench::started(4);
        // occupy the ECU's inbound slot
        b.tester.send(&[0x3E, 0x00]).unwrap();
        b.tick();
        assert_eq!(b.ecu.receive(), Some(vec![0x3E, 0x00]));
        assert_eq!(b.expect_request(), vec![0x10, 0x01]);
    }

    #[test]
    fn test_invalid_session_echo() {
        let mut b = Bench::started(4);
        b.expect_request();
        b.reply(&[0x50, 0x03]);
        assert!(matches!(
            b.reason(),
            Some(AbortReason::InvalidResponse {
                step: FlashStep::EnterDefaultSession,
                ..
            })
        ));
    }

    #[test]
    fn test_routine_status() {
        assert!(expect_routine_success(&[0x01, 0xFF, 0x00, 0x00], 0xFF00).is_ok());
        assert!(expect_routine_success(&[0x01, 0xFF, 0x00], 0xFF00).is_ok());
        assert!(expect_routine_success(&[0x01, 0xFF, 0x00, 0x01], 0xFF00).is_err());
        assert!(expect_routine_success(&[0x01, 0x02, 0x00, 0x00], 0xFF00).is_err());
        assert!(expect_routine_success(&[0x01], 0xFF00).is_err());
    }

    #[test]
    fn test_download_clamps_block_size() {
        let mut b = Bench::started(4);
        b.orch.step = FlashStep::RequestDownload;
        b.orch.consume(&[0x20, 0x01, 0x02]).unwrap();
        assert_eq!(b.orch.block_size(), 256);
        b.orch.consume(&[0x20, 0x0F, 0x02]).unwrap();
        assert_eq!(b.orch.block_size(), 1024);
        assert!(b.orch.consume(&[0x20, 0x00, 0x02]).is_err());
        assert!(b.orch.consume(&[0x50, 0x00]).is_err());
    }

    #[test]
    fn test_start_file_missing() {
        let mut b = Bench::new(FlashConfig::default());
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            b.orch.start_file(dir.path().join("missing.bin")),
            Err(FlashError::Image(_))
        ));
        assert!(b.orch.is_idle());
    }
}
