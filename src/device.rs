//! Per-node facade binding one instance of each service.

use std::time::Duration;

use crate::emcy::EmergencyMonitor;
use crate::error::{validate_node_id, ValidationError};
use crate::frame::{NmtCommand, NmtState};
use crate::heartbeat::{HeartbeatConsumer, DEFAULT_CHECK_INTERVAL};
use crate::nmt::{self, NmtMaster};
use crate::pdo::{PdoConfig, PdoManager, PdoManagerError, PdoNumber};
use crate::sdo::{ObjectAddress, SdoClient, SdoClientError};
use crate::sync::SyncProducer;
use crate::transport::{AsyncCanSender, Bus, Connection, SharedSender, TransportError};

/// Binds a single node id to one instance of every protocol service, and
/// tracks that node's last known NMT state.
#[derive(Debug)]
pub struct Device<S: AsyncCanSender + 'static> {
    node_id: u8,
    nmt: NmtMaster<SharedSender<S>>,
    sdo: SdoClient<SharedSender<S>>,
    pdo: PdoManager<SharedSender<S>>,
    emcy: EmergencyMonitor,
    heartbeat: HeartbeatConsumer,
    sync: Option<SyncProducer>,
    sync_sender: SharedSender<S>,
    nmt_state: NmtState,
}

impl<S: AsyncCanSender + 'static> Device<S> {
    /// Bind a facade to `node_id`, subscribing each service to `bus` and
    /// sending through `sender` (wrapped in a shared, lockable handle all
    /// services clone).
    pub fn new(node_id: u8, sender: S, bus: &Bus) -> Result<Self, ValidationError> {
        validate_node_id(node_id)?;
        let shared = SharedSender::new(sender);

        Ok(Self {
            node_id,
            nmt: NmtMaster::new(shared.clone()),
            sdo: SdoClient::new(node_id, shared.clone(), bus.subscribe()),
            pdo: PdoManager::new(shared.clone(), bus.subscribe()),
            emcy: EmergencyMonitor::new(bus.subscribe()),
            heartbeat: HeartbeatConsumer::new(bus.subscribe(), DEFAULT_CHECK_INTERVAL),
            sync: None,
            sync_sender: shared,
            nmt_state: NmtState::PreOperational,
        })
    }

    /// The bound node id.
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// The last NMT state recorded for this node (optimistic: updated from
    /// outbound Start/Stop/Pre-Operational commands, not from observed
    /// heartbeats).
    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    async fn send_nmt(&mut self, cmd: NmtCommand) -> Result<(), crate::frame::Frame> {
        self.nmt.send(self.node_id, cmd).await?;
        if let Some(state) = nmt::optimistic_state_after(cmd) {
            self.nmt_state = state;
        }
        Ok(())
    }

    /// Move this node to Operational.
    pub async fn start(&mut self) -> Result<(), crate::frame::Frame> {
        self.send_nmt(NmtCommand::Start).await
    }

    /// Move this node to Stopped.
    pub async fn stop(&mut self) -> Result<(), crate::frame::Frame> {
        self.send_nmt(NmtCommand::Stop).await
    }

    /// Move this node to Pre-Operational.
    pub async fn enter_pre_operational(&mut self) -> Result<(), crate::frame::Frame> {
        self.send_nmt(NmtCommand::EnterPreOperational).await
    }

    /// Reset this node's application.
    pub async fn reset_node(&mut self) -> Result<(), crate::frame::Frame> {
        self.send_nmt(NmtCommand::ResetNode).await
    }

    /// Reset this node's communication layer.
    pub async fn reset_communication(&mut self) -> Result<(), crate::frame::Frame> {
        self.send_nmt(NmtCommand::ResetCommunication).await
    }

    /// Read an object from this node.
    pub async fn upload(&mut self, addr: ObjectAddress) -> Result<Vec<u8>, SdoClientError> {
        self.sdo.upload(addr).await
    }

    /// Write an object on this node.
    pub async fn download(&mut self, addr: ObjectAddress, data: &[u8]) -> Result<(), SdoClientError> {
        self.sdo.download(addr, data).await
    }

    /// Read an unsigned 8-bit value.
    pub async fn read_u8(&mut self, addr: ObjectAddress) -> Result<u8, SdoClientError> {
        self.sdo.read_u8(addr).await
    }

    /// Read an unsigned 16-bit value.
    pub async fn read_u16(&mut self, addr: ObjectAddress) -> Result<u16, SdoClientError> {
        self.sdo.read_u16(addr).await
    }

    /// Read an unsigned 32-bit value.
    pub async fn read_u32(&mut self, addr: ObjectAddress) -> Result<u32, SdoClientError> {
        self.sdo.read_u32(addr).await
    }

    /// Write an unsigned 8-bit value.
    pub async fn write_u8(&mut self, addr: ObjectAddress, value: u8) -> Result<(), SdoClientError> {
        self.sdo.write_u8(addr, value).await
    }

    /// Write an unsigned 16-bit value.
    pub async fn write_u16(&mut self, addr: ObjectAddress, value: u16) -> Result<(), SdoClientError> {
        self.sdo.write_u16(addr, value).await
    }

    /// Write an unsigned 32-bit value.
    pub async fn write_u32(&mut self, addr: ObjectAddress, value: u32) -> Result<(), SdoClientError> {
        self.sdo.write_u32(addr, value).await
    }

    /// Read the manufacturer device name string (object 0x1008).
    pub async fn read_device_name(&mut self) -> Result<String, SdoClientError> {
        self.sdo.read_utf8(ObjectAddress::new(0x1008, 0)).await
    }

    /// Install a standard TPDO slot with the node's default COB-ID.
    pub async fn install_standard_tpdo(&self, pdo_number: PdoNumber, transmission_type: u8) {
        let cob_id = pdo_number.tpdo_cob_id(self.node_id);
        let config = PdoConfig::new(pdo_number, cob_id, transmission_type);
        self.pdo.configure_tpdo(pdo_number, config).await;
    }

    /// Install a standard RPDO slot with the node's default COB-ID.
    pub async fn install_standard_rpdo(&self, pdo_number: PdoNumber, transmission_type: u8) {
        let cob_id = pdo_number.rpdo_cob_id(self.node_id);
        let config = PdoConfig::new(pdo_number, cob_id, transmission_type);
        self.pdo.configure_rpdo(pdo_number, config).await;
    }

    /// Replace a TPDO's configuration wholesale (e.g. after adding mappings).
    pub async fn configure_tpdo(&self, pdo_number: PdoNumber, config: PdoConfig) {
        self.pdo.configure_tpdo(pdo_number, config).await;
    }

    /// Replace an RPDO's configuration wholesale.
    pub async fn configure_rpdo(&self, pdo_number: PdoNumber, config: PdoConfig) {
        self.pdo.configure_rpdo(pdo_number, config).await;
    }

    /// Send an RPDO through this node's configured slot.
    pub async fn send_rpdo(&mut self, pdo_number: PdoNumber, data: &[u8]) -> Result<(), PdoManagerError> {
        self.pdo.send_rpdo(pdo_number, data).await
    }

    /// Await the next received TPDO.
    pub async fn next_pdo_event(&mut self) -> Option<crate::pdo::PdoData> {
        self.pdo.next_event().await
    }

    /// Start watching this node's heartbeat with the given deadline.
    pub async fn enable_heartbeat(&self, timeout: Duration) {
        self.heartbeat.monitor(self.node_id, timeout).await;
    }

    /// Stop watching this node's heartbeat.
    pub async fn disable_heartbeat(&self) {
        self.heartbeat.stop(self.node_id).await;
    }

    /// Await the next heartbeat event for this node (or any other node
    /// sharing this facade's bus subscription, since heartbeat watches are
    /// per-node but the event stream is shared by the consumer instance).
    pub async fn next_heartbeat_event(&mut self) -> Option<crate::heartbeat::HeartbeatEvent> {
        self.heartbeat.next_event().await
    }

    /// The latest retained emergency record for this node, if any.
    pub async fn latest_emergency(&self) -> Option<crate::emcy::EmergencyRecord> {
        self.emcy.latest(self.node_id).await
    }

    /// Start producing SYNC frames at `period`, with or without the rolling
    /// counter byte.
    pub fn enable_sync(&mut self, period: Duration, use_counter: bool) {
        let mut producer = self.sync.take().unwrap_or_else(SyncProducer::new);
        producer.start(self.sync_sender.clone(), period, use_counter);
        self.sync = Some(producer);
    }

    /// Stop producing SYNC frames.
    pub fn disable_sync(&mut self) {
        if let Some(producer) = self.sync.as_mut() {
            producer.stop();
        }
    }
}

impl<S: AsyncCanSender + Connection + 'static> Device<S> {
    /// Establish the underlying transport connection.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.sync_sender.connect().await
    }

    /// Tear down the underlying transport connection.
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.sync_sender.disconnect().await
    }

    /// Whether the underlying transport is currently connected.
    pub fn is_connected(&self) -> bool {
        self.sync_sender.is_connected()
    }
}
