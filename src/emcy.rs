//! Emergency (EMCY) frame monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::frame::EmergencyFrame;
use crate::transport::BusSubscription;

/// CiA 301 error register bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorRegister(pub u8);

impl ErrorRegister {
    /// Bit 0: generic error.
    pub fn generic(self) -> bool {
        self.0 & 0x01 != 0
    }
    /// Bit 1: current.
    pub fn current(self) -> bool {
        self.0 & 0x02 != 0
    }
    /// Bit 2: voltage.
    pub fn voltage(self) -> bool {
        self.0 & 0x04 != 0
    }
    /// Bit 3: temperature.
    pub fn temperature(self) -> bool {
        self.0 & 0x08 != 0
    }
    /// Bit 4: communication.
    pub fn communication(self) -> bool {
        self.0 & 0x10 != 0
    }
    /// Bit 5: device profile specific.
    pub fn device_profile(self) -> bool {
        self.0 & 0x20 != 0
    }
    /// Bit 7: manufacturer specific.
    pub fn manufacturer_specific(self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// A retained emergency record for one node.
#[derive(Clone, Copy, Debug)]
pub struct EmergencyRecord {
    /// Node that raised it.
    pub node_id: u8,
    /// Error code from the device profile / CiA 301 Annex.
    pub error_code: u16,
    /// Error register bitfield.
    pub error_register: ErrorRegister,
    /// Manufacturer-specific trailing bytes.
    pub manufacturer: [u8; 5],
    /// When it was observed.
    pub timestamp: Instant,
}

#[derive(Debug, Default)]
struct State {
    latest: HashMap<u8, EmergencyRecord>,
}

/// An event raised by the emergency monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyEvent {
    /// An EMCY frame was decoded and its record retained.
    Received {
        /// The node that raised it.
        node_id: u8,
        /// Error code from the device profile / CiA 301 Annex.
        error_code: u16,
        /// Error register bitfield.
        error_register: ErrorRegister,
    },
}

/// Decodes inbound EMCY frames and retains the latest record per node.
#[derive(Debug)]
pub struct EmergencyMonitor {
    state: Arc<Mutex<State>>,
    events_rx: mpsc::Receiver<EmergencyEvent>,
    _task: JoinHandle<()>,
}

impl EmergencyMonitor {
    /// Subscribe to `bus` and start tracking emergency records.
    pub fn new(mut subscription: BusSubscription) -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let (events_tx, events_rx) = mpsc::channel(256);
        let state_clone = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let received = match subscription.recv().await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let Some(decoded) = EmergencyFrame::decode(&received.frame) else {
                    log::debug!("dropping frame not decodable as an EMCY record: {:?}", received.frame);
                    continue;
                };
                let record = EmergencyRecord {
                    node_id: decoded.node_id,
                    error_code: decoded.error_code,
                    error_register: ErrorRegister(decoded.error_register),
                    manufacturer: decoded.manufacturer,
                    timestamp: received.timestamp,
                };
                let mut state = state_clone.lock().await;
                state.latest.insert(record.node_id, record);
                drop(state);
                let _ = events_tx
                    .send(EmergencyEvent::Received {
                        node_id: record.node_id,
                        error_code: record.error_code,
                        error_register: record.error_register,
                    })
                    .await;
            }
        });
        Self {
            state,
            events_rx,
            _task: task,
        }
    }

    /// The latest retained record for `node_id`, if any.
    pub async fn latest(&self, node_id: u8) -> Option<EmergencyRecord> {
        self.state.lock().await.latest.get(&node_id).copied()
    }

    /// Drop the retained record for a single node.
    pub async fn clear(&self, node_id: u8) {
        self.state.lock().await.latest.remove(&node_id);
    }

    /// Drop all retained records.
    pub async fn clear_all(&self) {
        self.state.lock().await.latest.clear();
    }

    /// Await the next emergency event.
    pub async fn next_event(&mut self) -> Option<EmergencyEvent> {
        self.events_rx.recv().await
    }
}
