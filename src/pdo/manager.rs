//! TPDO/RPDO configuration registry, transmit path, and inbound dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use snafu::Snafu;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::config::{PdoConfig, PdoConfigError, PdoNumber};
use crate::frame::{CobId, Frame};
use crate::transport::{AsyncCanSender, BusSubscription};

/// A received TPDO delivery.
#[derive(Clone, Debug)]
pub struct PdoData {
    /// Which configured slot matched.
    pub pdo_number: u8,
    /// The COB-ID it arrived on.
    pub cob_id: CobId,
    /// The raw payload.
    pub payload: Vec<u8>,
    /// When it was observed.
    pub timestamp: Instant,
}

/// Errors from PDO manager operations.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum PdoManagerError {
    /// No configuration exists for the requested slot.
    #[snafu(display("no RPDO configuration for slot {pdo_number}"))]
    NotConfigured {
        /// The requested slot.
        pdo_number: u8,
    },
    /// The configuration stored for this slot fails validation.
    #[snafu(display("RPDO {pdo_number} configuration is invalid: {issues:?}"))]
    InvalidConfig {
        /// The requested slot.
        pdo_number: u8,
        /// Problems `PdoConfig::validate` reported.
        issues: Vec<String>,
    },
    /// Payload longer than 8 bytes.
    #[snafu(display("PDO payload of {len} bytes exceeds the 8-byte maximum"))]
    PayloadTooLong {
        /// The rejected length.
        len: usize,
    },
    /// RTR-based TPDO requests aren't supported.
    RtrRequestUnsupported,
    /// A config mutation failed.
    #[snafu(display("{source}"))]
    Config {
        /// The underlying config error.
        source: PdoConfigError,
    },
}

#[derive(Debug, Default)]
struct Registries {
    tpdo: HashMap<u8, PdoConfig>,
    rpdo: HashMap<u8, PdoConfig>,
}

/// Owns the local TPDO/RPDO configuration registries for one node, sends
/// RPDOs, and dispatches inbound TPDO frames as [`PdoData`] events.
#[derive(Debug)]
pub struct PdoManager<S: AsyncCanSender> {
    sender: S,
    registries: Arc<Mutex<Registries>>,
    events_rx: mpsc::Receiver<PdoData>,
    _dispatch_task: JoinHandle<()>,
}

impl<S: AsyncCanSender + 'static> PdoManager<S> {
    /// Build a manager, subscribing to inbound frames for TPDO dispatch.
    pub fn new(sender: S, mut subscription: BusSubscription) -> Self {
        let registries = Arc::new(Mutex::new(Registries::default()));
        let (events_tx, events_rx) = mpsc::channel(256);
        let registries_clone = registries.clone();
        let dispatch_task = tokio::spawn(async move {
            loop {
                let received = match subscription.recv().await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let frame = received.frame;
                let registries = registries_clone.lock().await;
                let matched = registries
                    .tpdo
                    .iter()
                    .find(|(_, cfg)| cfg.cob_id == frame.id());
                match matched {
                    Some((number, _cfg)) => {
                        let data = PdoData {
                            pdo_number: *number,
                            cob_id: frame.id(),
                            payload: frame.data().to_vec(),
                            timestamp: received.timestamp,
                        };
                        drop(registries);
                        let _ = events_tx.send(data).await;
                    }
                    None => {
                        log::debug!("dropping frame with no matching TPDO config: {frame:?}");
                    }
                }
            }
        });
        Self {
            sender,
            registries,
            events_rx,
            _dispatch_task: dispatch_task,
        }
    }

    /// Install or replace the configuration for a TPDO slot.
    pub async fn configure_tpdo(&self, pdo_number: PdoNumber, config: PdoConfig) {
        self.registries
            .lock()
            .await
            .tpdo
            .insert(pdo_number as u8, config);
    }

    /// Install or replace the configuration for an RPDO slot.
    pub async fn configure_rpdo(&self, pdo_number: PdoNumber, config: PdoConfig) {
        self.registries
            .lock()
            .await
            .rpdo
            .insert(pdo_number as u8, config);
    }

    /// Send an RPDO using its stored configuration.
    pub async fn send_rpdo(&mut self, pdo_number: PdoNumber, data: &[u8]) -> Result<(), PdoManagerError> {
        if data.len() > 8 {
            return Err(PdoManagerError::PayloadTooLong { len: data.len() });
        }
        let cob_id = {
            let registries = self.registries.lock().await;
            let cfg = registries
                .rpdo
                .get(&(pdo_number as u8))
                .ok_or(PdoManagerError::NotConfigured {
                    pdo_number: pdo_number as u8,
                })?;
            let issues = cfg.validate();
            if !issues.is_empty() {
                return Err(PdoManagerError::InvalidConfig {
                    pdo_number: pdo_number as u8,
                    issues,
                });
            }
            cfg.cob_id
        };
        self.sender
            .send(Frame::new(cob_id, data))
            .await
            .map_err(|_| PdoManagerError::NotConfigured {
                pdo_number: pdo_number as u8,
            })
    }

    /// RTR-based TPDO requests are not supported by this stack.
    pub fn request_tpdo(&self, _pdo_number: PdoNumber) -> Result<(), PdoManagerError> {
        Err(PdoManagerError::RtrRequestUnsupported)
    }

    /// Await the next received TPDO.
    pub async fn next_event(&mut self) -> Option<PdoData> {
        self.events_rx.recv().await
    }

    /// Snapshot of a TPDO's current configuration, if any.
    pub async fn tpdo_config(&self, pdo_number: PdoNumber) -> Option<PdoConfig> {
        self.registries.lock().await.tpdo.get(&(pdo_number as u8)).cloned()
    }

    /// Snapshot of an RPDO's current configuration, if any.
    pub async fn rpdo_config(&self, pdo_number: PdoNumber) -> Option<PdoConfig> {
        self.registries.lock().await.rpdo.get(&(pdo_number as u8)).cloned()
    }
}
