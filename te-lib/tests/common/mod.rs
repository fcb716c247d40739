//! Shared test utilities: canned frame builders and fake transports that
//! implement the session-facing transport traits.

#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use te_lib::can::ca::{Address, AddressClaim, ControllerApp, Message};
#[allow(unused_imports)]
pub use te_lib::can::pgn::{Pgn, std_pgn, te_pgn};
#[allow(unused_imports)]
pub use te_lib::error::Result;
#[allow(unused_imports)]
pub use te_lib::hid::reports::ReportFrame;
#[allow(unused_imports)]
pub use te_lib::hid::transport::{HidEndpoint, HidIo};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Decode a hex string into bytes.
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("failed to decode hex")
}

/// Build a received CAN message stamped "now".
#[allow(dead_code)]
pub fn can_msg(pgn: Pgn, sa: u8, data: &[u8]) -> Message {
    Message {
        address: Address {
            priority: 6,
            pgn,
            source_address: sa,
        },
        data: Bytes::copy_from_slice(data),
        timestamp: Instant::now(),
    }
}

/// Build a received HID report stamped "now".
#[allow(dead_code)]
pub fn hid_frame(raw: &[u8]) -> ReportFrame {
    ReportFrame::new(raw.to_vec(), Instant::now())
}

#[derive(Default)]
pub struct FakeCaState {
    pub queue: VecDeque<Message>,
    pub sent: Vec<(Pgn, u8, Vec<u8>)>,
}

/// Scriptable controller application: pops pre-queued messages and records
/// every send.
pub struct FakeCa {
    pub own_address: u8,
    pub state: Arc<Mutex<FakeCaState>>,
}

impl FakeCa {
    #[allow(dead_code)]
    pub fn new(own_address: u8) -> (Self, Arc<Mutex<FakeCaState>>) {
        let state = Arc::new(Mutex::new(FakeCaState::default()));
        (
            Self {
                own_address,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl ControllerApp for FakeCa {
    fn interface_name(&self) -> &str {
        "can0"
    }

    fn address(&self) -> u8 {
        self.own_address
    }

    async fn send_to(&mut self, pgn: Pgn, dest: u8, data: &[u8]) -> Result<usize> {
        self.state.lock().unwrap().sent.push((pgn, dest, data.to_vec()));
        Ok(data.len())
    }

    async fn recv_msg(&mut self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.state.lock().unwrap().queue.pop_front() {
                return Some(msg);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn disconnect(&mut self) {}
}

#[derive(Default)]
pub struct FakeHidState {
    pub queue: VecDeque<ReportFrame>,
    pub sent: Vec<(HidEndpoint, Vec<u8>)>,
    pub feature_reports: HashMap<u8, Vec<u8>>,
    pub input_reports: HashMap<u8, Vec<u8>>,
    pub update_payloads: Vec<Vec<u8>>,
}

/// Scriptable HID transport.
pub struct FakeHid {
    pub serial: String,
    pub widget: bool,
    pub state: Arc<Mutex<FakeHidState>>,
}

impl FakeHid {
    #[allow(dead_code)]
    pub fn new(serial: &str) -> (Self, Arc<Mutex<FakeHidState>>) {
        let state = Arc::new(Mutex::new(FakeHidState::default()));
        (
            Self {
                serial: serial.to_string(),
                widget: true,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl HidIo for FakeHid {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn has_widget(&self) -> bool {
        self.widget
    }

    async fn send(&mut self, endpoint: HidEndpoint, data: &[u8]) -> Result<usize> {
        if endpoint == HidEndpoint::Widget && !self.widget {
            return Ok(0);
        }
        self.state.lock().unwrap().sent.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    async fn get_feature_report(&mut self, report_id: u8, _len: usize) -> Result<Vec<u8>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .feature_reports
            .get(&report_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_input_report(&mut self, report_id: u8, _len: usize) -> Result<Vec<u8>> {
        if !self.widget {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .input_reports
            .get(&report_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_update_payload(&mut self, data: &[u8]) -> Result<usize> {
        self.state.lock().unwrap().update_payloads.push(data.to_vec());
        Ok(data.len())
    }

    async fn recv_report(&mut self, timeout: Duration) -> Option<ReportFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.state.lock().unwrap().queue.pop_front() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn disconnect(&mut self) {}

    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}
