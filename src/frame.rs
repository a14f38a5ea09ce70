//! CAN frame type and the small set of service codecs that operate on raw
//! bytes rather than the SDO state machine (NMT, heartbeat, SYNC, EMCY).

use snafu::Snafu;
use std::time::Instant;

/// Maximum payload length of a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// An 11-bit standard CAN identifier.
///
/// Extended (29-bit) identifiers are out of scope for this stack; the raw
/// value is masked to 11 bits wherever one is constructed from an integer
/// that might carry more.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CobId(u16);

impl CobId {
    /// Build a `CobId`, masking to 11 bits.
    pub const fn new(raw: u16) -> Self {
        CobId(raw & 0x7FF)
    }

    /// The raw 11-bit value.
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for CobId {
    fn from(raw: u16) -> Self {
        CobId::new(raw)
    }
}

/// A received or about-to-be-sent CAN frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    id: CobId,
    data: [u8; MAX_DATA_LEN],
    dlc: u8,
}

impl Frame {
    /// Construct a frame. Panics if `data` is longer than [`MAX_DATA_LEN`];
    /// callers that can't guarantee this should use [`Frame::try_new`].
    pub fn new(id: CobId, data: &[u8]) -> Self {
        Self::try_new(id, data).expect("frame payload exceeds 8 bytes")
    }

    /// Construct a frame, rejecting oversized payloads instead of panicking.
    pub fn try_new(id: CobId, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_DATA_LEN {
            return Err(FrameError::PayloadTooLong { len: data.len() });
        }
        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            dlc: data.len() as u8,
        })
    }

    /// The identifier this frame was sent or received on.
    pub fn id(&self) -> CobId {
        self.id
    }

    /// The valid payload bytes (`0..dlc`).
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Number of valid payload bytes.
    pub fn dlc(&self) -> u8 {
        self.dlc
    }
}

/// A frame paired with the instant it was received.
#[derive(Clone, Copy, Debug)]
pub struct ReceivedFrame {
    /// The frame itself.
    pub frame: Frame,
    /// When the transport observed it.
    pub timestamp: Instant,
}

/// Errors constructing or decoding frames.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum FrameError {
    /// Payload longer than the 8 bytes a classic CAN frame can carry.
    #[snafu(display("frame payload of {len} bytes exceeds the 8-byte maximum"))]
    PayloadTooLong {
        /// The rejected length.
        len: usize,
    },
    /// Payload too short for the service being decoded.
    #[snafu(display("payload too short: expected at least {expected} bytes, got {actual}"))]
    PayloadTooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },
    /// A value outside the domain of the enum being decoded.
    #[snafu(display("unrecognized value {value:#x} decoding {what}"))]
    UnrecognizedValue {
        /// What was being decoded ("nmt state", "nmt command", ...).
        what: &'static str,
        /// The offending byte, widened to u32 for display.
        value: u32,
    },
}

/// DS-301 network management commands the master can issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmtCommand {
    /// Move a node (or all nodes) to Operational.
    Start,
    /// Move a node (or all nodes) to Stopped.
    Stop,
    /// Move a node (or all nodes) to Pre-Operational.
    EnterPreOperational,
    /// Reset the node's application.
    ResetNode,
    /// Reset the node's communication layer.
    ResetCommunication,
}

impl NmtCommand {
    fn cs(self) -> u8 {
        match self {
            NmtCommand::Start => 0x01,
            NmtCommand::Stop => 0x02,
            NmtCommand::EnterPreOperational => 0x80,
            NmtCommand::ResetNode => 0x81,
            NmtCommand::ResetCommunication => 0x82,
        }
    }

    /// Encode this command for `node_id` (0 means broadcast) as a frame on
    /// COB-ID `0x000`.
    pub fn to_frame(self, node_id: u8) -> Frame {
        Frame::new(CobId::new(0x000), &[self.cs(), node_id])
    }
}

/// Observed NMT state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmtState {
    /// Node is booting / initializing.
    Initializing,
    /// Node is stopped; only NMT traffic is processed.
    Stopped,
    /// Node is fully operational.
    Operational,
    /// Node is pre-operational (SDO available, PDOs disabled).
    PreOperational,
    /// The boot-up announcement itself (identical wire value to Initializing).
    BootUp,
    /// A value outside the defined set was observed.
    Unknown(u8),
}

impl NmtState {
    /// Decode the single heartbeat/boot-up state byte.
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => NmtState::BootUp,
            0x04 => NmtState::Stopped,
            0x05 => NmtState::Operational,
            0x7F => NmtState::PreOperational,
            other => NmtState::Unknown(other),
        }
    }

    /// Encode back to the wire byte used by heartbeat frames.
    pub fn to_byte(self) -> u8 {
        match self {
            NmtState::Initializing | NmtState::BootUp => 0x00,
            NmtState::Stopped => 0x04,
            NmtState::Operational => 0x05,
            NmtState::PreOperational => 0x7F,
            NmtState::Unknown(b) => b,
        }
    }
}

/// A decoded heartbeat announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// Node that produced the heartbeat.
    pub node_id: u8,
    /// The state it announced.
    pub state: NmtState,
}

impl Heartbeat {
    /// Base COB-ID for heartbeat frames; a node's heartbeat identifier is
    /// `HEARTBEAT_BASE + node_id`.
    pub const BASE: u16 = 0x700;

    /// Decode a heartbeat frame. Returns `None` if `id` is not in the
    /// heartbeat range or the payload is empty.
    pub fn decode(frame: &Frame) -> Option<Self> {
        let raw = frame.id().raw();
        if !(0x701..=0x77F).contains(&raw) {
            return None;
        }
        let data = frame.data();
        if data.is_empty() {
            return None;
        }
        Some(Heartbeat {
            node_id: (raw - Self::BASE) as u8,
            state: NmtState::from_byte(data[0]),
        })
    }

    /// Encode this heartbeat to a frame (mainly useful in loopback tests).
    pub fn to_frame(self) -> Frame {
        Frame::new(
            CobId::new(Self::BASE + self.node_id as u16),
            &[self.state.to_byte()],
        )
    }
}

/// A decoded Emergency announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmergencyFrame {
    /// Node that raised the emergency.
    pub node_id: u8,
    /// Manufacturer/profile-defined error code.
    pub error_code: u16,
    /// CiA 301 error register bitfield.
    pub error_register: u8,
    /// Manufacturer-specific trailing bytes.
    pub manufacturer: [u8; 5],
}

impl EmergencyFrame {
    /// Base COB-ID; a node's emergency identifier is `EMCY_BASE + node_id`.
    pub const BASE: u16 = 0x080;

    /// Decode an 8-byte emergency payload. Returns `None` if `id` is not in
    /// the emergency range (`0x081..=0x0FF`) or the payload is short.
    pub fn decode(frame: &Frame) -> Option<Self> {
        let raw = frame.id().raw();
        if !(0x081..=0x0FF).contains(&raw) {
            return None;
        }
        let data = frame.data();
        if data.len() < 8 {
            return None;
        }
        Some(EmergencyFrame {
            node_id: (raw - Self::BASE) as u8,
            error_code: u16::from_le_bytes([data[0], data[1]]),
            error_register: data[2],
            manufacturer: [data[3], data[4], data[5], data[6], data[7]],
        })
    }

    /// Encode this record back to a frame (used by loopback tests).
    pub fn to_frame(self) -> Frame {
        let code = self.error_code.to_le_bytes();
        let mut data = [0u8; 8];
        data[0] = code[0];
        data[1] = code[1];
        data[2] = self.error_register;
        data[3..8].copy_from_slice(&self.manufacturer);
        Frame::new(CobId::new(Self::BASE + self.node_id as u16), &data)
    }
}

/// A decoded SYNC frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Sync {
    /// The optional rolling counter byte.
    pub counter: Option<u8>,
}

impl Sync {
    /// COB-ID SYNC is produced and consumed on.
    pub const COB_ID: u16 = 0x080;

    /// Decode a SYNC frame. Returns `None` if the identifier doesn't match.
    pub fn decode(frame: &Frame) -> Option<Self> {
        if frame.id().raw() != Self::COB_ID {
            return None;
        }
        Some(Sync {
            counter: frame.data().first().copied(),
        })
    }

    /// Encode to a frame, with or without the counter byte.
    pub fn to_frame(self) -> Frame {
        match self.counter {
            Some(c) => Frame::new(CobId::new(Self::COB_ID), &[c]),
            None => Frame::new(CobId::new(Self::COB_ID), &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmt_command_encodes_cs_and_node() {
        let f = NmtCommand::Start.to_frame(5);
        assert_eq!(f.id().raw(), 0x000);
        assert_eq!(f.data(), &[0x01, 0x05]);
    }

    #[test]
    fn heartbeat_decodes_node_and_state() {
        let f = Frame::new(CobId::new(0x703), &[0x05]);
        let hb = Heartbeat::decode(&f).unwrap();
        assert_eq!(hb.node_id, 3);
        assert_eq!(hb.state, NmtState::Operational);
    }

    #[test]
    fn heartbeat_ignores_non_heartbeat_ids() {
        let f = Frame::new(CobId::new(0x080), &[0x05]);
        assert!(Heartbeat::decode(&f).is_none());
    }

    #[test]
    fn emcy_decodes_fields() {
        let f = Frame::new(CobId::new(0x082), &[0x10, 0x11, 0x04, 1, 2, 3, 4, 5]);
        let e = EmergencyFrame::decode(&f).unwrap();
        assert_eq!(e.node_id, 2);
        assert_eq!(e.error_code, 0x1110);
        assert_eq!(e.error_register, 0x04);
        assert_eq!(e.manufacturer, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn emcy_rejects_short_payload() {
        let f = Frame::new(CobId::new(0x082), &[0x10, 0x11]);
        assert!(EmergencyFrame::decode(&f).is_none());
    }

    #[test]
    fn sync_roundtrips_with_and_without_counter() {
        let s = Sync { counter: Some(7) };
        let f = s.to_frame();
        assert_eq!(Sync::decode(&f), Some(s));

        let s = Sync { counter: None };
        let f = s.to_frame();
        assert_eq!(Sync::decode(&f), Some(s));
    }

    #[test]
    fn cob_id_masks_to_11_bits() {
        assert_eq!(CobId::new(0xFFFF).raw(), 0x7FF);
    }
}
