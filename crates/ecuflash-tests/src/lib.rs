//! Integration tests for the ecuflash tester and bootloader
//!
//! The tests wire a [`FlashOrchestrator`] and an [`EcuServer`] together over
//! the loopback link and run them against a [`ManualClock`], so every
//! scenario (including the 1.5 s settle and the 10 s security delay) runs
//! in milliseconds and is fully deterministic.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p ecuflash-tests
//! ```
//!
//! # Test Structure
//!
//! - `flash_e2e_test.rs` - complete update jobs, block sizing, counter wrap, file output
//! - `failure_test.rs` - timeouts, negative responses, security delay
//! - `transfer_test.rs` - block sequence discipline driven frame by frame

use std::sync::Arc;

use ecuflash_client::{FirmwareImage, FlashConfig, FlashOrchestrator, JobReport};
use ecuflash_ecu::{EcuConfig, EcuServer, MemorySinkProvider, SinkProvider};
use ecuflash_proto::uds::service_id;
use ecuflash_proto::{
    LoopbackEndpoint, LoopbackLink, ManualClock, Transport, TransportError, UdsResponse,
};
use parking_lot::Mutex;

/// Clock value the bench starts at
pub const START_MS: u64 = 1_000;

/// Transport wrapper that keeps a copy of every frame it moves
pub struct RecordingTransport<T> {
    inner: T,
    sent: Mutex<Vec<Vec<u8>>>,
    received: Mutex<Vec<Vec<u8>>>,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            sent: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }
}

impl<T: Transport> Transport for RecordingTransport<T> {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.inner.send(frame)?;
        self.sent.lock().push(frame.to_vec());
        Ok(())
    }

    fn receive(&self) -> Option<Vec<u8>> {
        let frame = self.inner.receive()?;
        self.received.lock().push(frame.clone());
        Some(frame)
    }
}

/// Tester and ECU on one loopback link, sharing a manual clock
pub struct FlashBench {
    pub clock: ManualClock,
    pub ecu: EcuServer,
    pub flasher: FlashOrchestrator,
    /// What the ECU reconstructed (empty when a custom sink is used)
    pub image: MemorySinkProvider,
    tester_end: RecordingTransport<LoopbackEndpoint>,
    ecu_end: LoopbackEndpoint,
    ecu_online: bool,
    ticks: u64,
}

impl FlashBench {
    /// Default configurations with reproducible seeds
    pub fn new() -> Self {
        Self::with_config(ecu_config(), FlashConfig::default())
    }

    pub fn with_config(ecu: EcuConfig, client: FlashConfig) -> Self {
        let image = MemorySinkProvider::new();
        Self::build(ecu, client, Box::new(image.clone()), image)
    }

    /// ECU writing through `sinks` instead of the in-memory image
    pub fn with_sinks(ecu: EcuConfig, client: FlashConfig, sinks: Box<dyn SinkProvider>) -> Self {
        Self::build(ecu, client, sinks, MemorySinkProvider::new())
    }

    fn build(
        ecu: EcuConfig,
        client: FlashConfig,
        sinks: Box<dyn SinkProvider>,
        image: MemorySinkProvider,
    ) -> Self {
        let clock = ManualClock::starting_at(START_MS);
        let (tester_end, ecu_end) = LoopbackLink::pair();
        Self {
            ecu: EcuServer::new(ecu, Arc::new(clock.clone()), sinks),
            flasher: FlashOrchestrator::new(client, Arc::new(clock.clone())),
            clock,
            image,
            tester_end: RecordingTransport::new(tester_end),
            ecu_end,
            ecu_online: true,
            ticks: 0,
        }
    }

    pub fn start(&mut self, data: Vec<u8>) {
        let image = FirmwareImage::from_bytes(data).expect("test image");
        self.flasher.start(image).expect("flasher idle");
    }

    /// A silent ECU leaves requests unanswered
    pub fn set_ecu_online(&mut self, online: bool) {
        self.ecu_online = online;
    }

    /// One millisecond: ECU answers what is waiting, tester advances
    pub fn tick(&mut self) {
        if self.ecu_online {
            self.ecu.poll(&self.ecu_end);
        }
        self.flasher.tick(&self.tester_end);
        self.clock.advance(1);
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Tick until the job finishes; panics after `max_ticks`
    pub fn run_to_completion(&mut self, max_ticks: u64) -> JobReport {
        for _ in 0..max_ticks {
            self.tick();
            if self.flasher.is_done() {
                return self.flasher.report().cloned().expect("finished job has a report");
            }
        }
        panic!(
            "job still at {:?} after {} ticks",
            self.flasher.step(),
            max_ticks
        );
    }

    /// Tick until `pred` holds; panics after `max_ticks`
    pub fn run_until(&mut self, max_ticks: u64, pred: impl Fn(&FlashBench) -> bool) {
        for _ in 0..max_ticks {
            if pred(self) {
                return;
            }
            self.tick();
        }
        panic!("condition not reached after {} ticks", max_ticks);
    }

    /// Every request the tester put on the link
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.tester_end.sent()
    }

    /// Every response the tester took off the link
    pub fn responses(&self) -> Vec<Vec<u8>> {
        self.tester_end.received()
    }

    pub fn requests_for(&self, sid: u8) -> Vec<Vec<u8>> {
        self.requests()
            .into_iter()
            .filter(|r| r.first() == Some(&sid))
            .collect()
    }

    pub fn negative_responses(&self) -> Vec<Vec<u8>> {
        self.responses()
            .into_iter()
            .filter(|r| r.first() == Some(&service_id::NEGATIVE_RESPONSE))
            .collect()
    }

    /// Send one request as a hand-driven tester and return the ECU's answer
    pub fn exchange(&mut self, request: &[u8]) -> Option<UdsResponse> {
        self.tester_end.send(request).expect("link idle");
        self.ecu.poll(&self.ecu_end);
        self.tester_end
            .receive()
            .and_then(|frame| UdsResponse::parse(&frame))
    }
}

impl Default for FlashBench {
    fn default() -> Self {
        Self::new()
    }
}

/// ECU defaults with a fixed RNG seed
pub fn ecu_config() -> EcuConfig {
    let mut config = EcuConfig::default();
    config.security.rng_seed = Some(0x00EC_F1A5);
    config
}

/// Deterministic, non-repeating-looking image content
pub fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// Positive response payload or a panic naming what came back instead
pub fn positive_data(response: Option<UdsResponse>) -> Vec<u8> {
    match response {
        Some(UdsResponse::Positive { data, .. }) => data,
        other => panic!("expected positive response, got {:?}", other),
    }
}
