//! Wire encoding/decoding for expedited SDO requests and responses.

use snafu::Snafu;

use crate::frame::{CobId, Frame, FrameError};

/// SDO request/response base COB-IDs; a node's addresses are these plus its
/// node id.
pub const REQUEST_BASE: u16 = 0x600;
pub const RESPONSE_BASE: u16 = 0x580;

/// SDO abort codes defined by CiA 301 Annex A, plus the ones DS-301 servers
/// commonly return for object-dictionary access failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated.
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out.
    SdoProtocolTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown.
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only).
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only).
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only).
    CrcError = 0x0504_0004,
    /// Out of memory.
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object.
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write-only object.
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read-only object.
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the object dictionary.
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO.
    UnsupportedPdoMapping = 0x0604_0041,
    /// The number and length of mapped objects would exceed PDO length.
    PdoLengthExceeded = 0x0604_0042,
    /// General parameter incompatibility reason.
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error.
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match.
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high.
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low.
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist.
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only).
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high (download only).
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low (download only).
    ValueTooLow = 0x0609_0032,
    /// Resource not available: SDO connection.
    ResourceNotAvailable = 0x060A_0023,
    /// General error.
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application.
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control.
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the present device state.
    CantStoreDeviceState = 0x0800_0022,
    /// Object dictionary dynamic generation fails or no dictionary present.
    NoObjectDictionary = 0x0800_0023,
    /// No data available.
    NoData = 0x0800_0024,
}

impl AbortCode {
    fn from_u32(value: u32) -> Option<Self> {
        use AbortCode::*;
        Some(match value {
            0x0503_0000 => ToggleNotAlternated,
            0x0504_0000 => SdoProtocolTimeout,
            0x0504_0001 => InvalidCommandSpecifier,
            0x0504_0002 => InvalidBlockSize,
            0x0504_0003 => InvalidSequenceNumber,
            0x0504_0004 => CrcError,
            0x0504_0005 => OutOfMemory,
            0x0601_0000 => UnsupportedAccess,
            0x0601_0001 => WriteOnly,
            0x0601_0002 => ReadOnly,
            0x0602_0000 => NoSuchObject,
            0x0604_0041 => UnsupportedPdoMapping,
            0x0604_0042 => PdoLengthExceeded,
            0x0604_0043 => IncompatibleParameter,
            0x0606_0000 => HardwareError,
            0x0607_0010 => DataTypeMismatch,
            0x0607_0012 => DataTypeMismatchLengthHigh,
            0x0607_0013 => DataTypeMismatchLengthLow,
            0x0609_0011 => NoSuchSubIndex,
            0x0609_0030 => InvalidValue,
            0x0609_0031 => ValueTooHigh,
            0x0609_0032 => ValueTooLow,
            0x060A_0023 => ResourceNotAvailable,
            0x0800_0000 => GeneralError,
            0x0800_0020 => CantStore,
            0x0800_0021 => CantStoreLocalControl,
            0x0800_0022 => CantStoreDeviceState,
            0x0800_0023 => NoObjectDictionary,
            0x0800_0024 => NoData,
            _ => return None,
        })
    }

    fn description(self) -> &'static str {
        use AbortCode::*;
        match self {
            ToggleNotAlternated => "toggle bit not alternated",
            SdoProtocolTimeout => "SDO protocol timed out",
            InvalidCommandSpecifier => "client/server command specifier not valid or unknown",
            InvalidBlockSize => "invalid block size",
            InvalidSequenceNumber => "invalid sequence number",
            CrcError => "CRC error",
            OutOfMemory => "out of memory",
            UnsupportedAccess => "unsupported access to an object",
            WriteOnly => "attempt to read a write-only object",
            ReadOnly => "attempt to write a read-only object",
            NoSuchObject => "object does not exist in the object dictionary",
            UnsupportedPdoMapping => "object cannot be mapped to the PDO",
            PdoLengthExceeded => "number and length of mapped objects exceeds PDO length",
            IncompatibleParameter => "general parameter incompatibility reason",
            HardwareError => "access failed due to a hardware error",
            DataTypeMismatch => "data type does not match, length of service parameter does not match",
            DataTypeMismatchLengthHigh => "data type does not match, length too high",
            DataTypeMismatchLengthLow => "data type does not match, length too low",
            NoSuchSubIndex => "sub-index does not exist",
            InvalidValue => "invalid value for parameter",
            ValueTooHigh => "value of parameter written too high",
            ValueTooLow => "value of parameter written too low",
            ResourceNotAvailable => "resource not available: SDO connection",
            GeneralError => "general error",
            CantStore => "data cannot be transferred or stored to the application",
            CantStoreLocalControl => {
                "data cannot be transferred or stored because of local control"
            }
            CantStoreDeviceState => {
                "data cannot be transferred or stored because of the present device state"
            }
            NoObjectDictionary => "object dictionary dynamic generation fails or no dictionary present",
            NoData => "no data available",
        }
    }
}

/// Range classification applied to a code not in the known table.
fn classify_unknown(value: u32) -> &'static str {
    match value {
        0x0503_0000..=0x0504_FFFF => "protocol error (unrecognized)",
        0x0601_0000..=0x060A_FFFF => "object dictionary error (unrecognized)",
        0x2000_0000.. => "manufacturer-specific",
        _ => "unrecognized",
    }
}

/// Wraps [`AbortCode`] so a code outside the known table can still be
/// carried and displayed rather than rejected outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A code this crate recognizes.
    Known(AbortCode),
    /// A code outside the known table, classified by numeric range.
    Unknown(u32),
}

impl RawAbortCode {
    /// Classify a raw 32-bit abort code.
    pub fn from_u32(value: u32) -> Self {
        match AbortCode::from_u32(value) {
            Some(code) => RawAbortCode::Known(code),
            None => RawAbortCode::Unknown(value),
        }
    }

    /// The raw numeric code, for any variant.
    pub fn raw(self) -> u32 {
        match self {
            RawAbortCode::Known(c) => c as u32,
            RawAbortCode::Unknown(v) => v,
        }
    }
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Known(code) => write!(f, "{:#010x} ({})", *code as u32, code.description()),
            RawAbortCode::Unknown(v) => write!(f, "{v:#010x} ({})", classify_unknown(*v)),
        }
    }
}

/// Address of an object dictionary entry: `(index, sub_index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAddress {
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary sub-index.
    pub sub: u8,
}

impl ObjectAddress {
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

/// An outbound expedited SDO request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoRequest {
    /// Initiate-upload (read) request.
    Upload {
        /// The object to read.
        addr: ObjectAddress,
    },
    /// Expedited initiate-download (write) request.
    Download {
        /// The object to write.
        addr: ObjectAddress,
        /// Valid byte count in `data` (1-4).
        len: u8,
        /// The payload, zero-padded past `len`.
        data: [u8; 4],
    },
    /// Client-initiated abort.
    Abort {
        /// The object the abort applies to.
        addr: ObjectAddress,
        /// The reason given to the server.
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Build an upload (read) request.
    pub fn upload(addr: ObjectAddress) -> Self {
        SdoRequest::Upload { addr }
    }

    /// Build an expedited download (write) request. `data` must be 1-4
    /// bytes; the remaining bytes of the 4-byte field are zero-filled.
    pub fn download(addr: ObjectAddress, data: &[u8]) -> Result<Self, CodecError> {
        if data.is_empty() || data.len() > 4 {
            return Err(CodecError::UnsupportedDataLength { len: data.len() });
        }
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        Ok(SdoRequest::Download {
            addr,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Build a client-initiated abort request.
    pub fn abort(addr: ObjectAddress, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            addr,
            abort_code: abort_code as u32,
        }
    }

    fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        match self {
            SdoRequest::Upload { addr } => {
                buf[0] = 0x40;
                buf[1..3].copy_from_slice(&addr.index.to_le_bytes());
                buf[3] = addr.sub;
            }
            SdoRequest::Download { addr, len, data } => {
                let n = 4 - len;
                buf[0] = 0x20 | (n << 2) | 0x02;
                buf[1..3].copy_from_slice(&addr.index.to_le_bytes());
                buf[3] = addr.sub;
                buf[4..8].copy_from_slice(&data);
            }
            SdoRequest::Abort { addr, abort_code } => {
                buf[0] = 0x80;
                buf[1..3].copy_from_slice(&addr.index.to_le_bytes());
                buf[3] = addr.sub;
                buf[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        buf
    }

    /// Encode to a frame addressed to `node_id`'s SDO server.
    pub fn to_frame(self, node_id: u8) -> Frame {
        Frame::new(CobId::new(REQUEST_BASE + node_id as u16), &self.to_bytes())
    }

    /// The object address this request targets.
    pub fn addr(self) -> ObjectAddress {
        match self {
            SdoRequest::Upload { addr } => addr,
            SdoRequest::Download { addr, .. } => addr,
            SdoRequest::Abort { addr, .. } => addr,
        }
    }
}

/// A decoded expedited SDO response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Confirmation of a download (write).
    ConfirmDownload {
        /// The object that was written.
        addr: ObjectAddress,
    },
    /// An upload (read) response carrying `len` valid bytes of `data`.
    ConfirmUpload {
        /// The object that was read.
        addr: ObjectAddress,
        /// Valid byte count in `data` (1-4).
        len: u8,
        /// The payload, zero-padded past `len`.
        data: [u8; 4],
    },
    /// Server aborted the transfer.
    Abort {
        /// The object the abort applies to.
        addr: ObjectAddress,
        /// The reason given.
        abort_code: RawAbortCode,
    },
}

impl SdoResponse {
    /// Decode an 8-byte SDO response payload.
    pub fn decode(frame: &Frame) -> Result<Self, CodecError> {
        let data = frame.data();
        if data.len() < 8 {
            return Err(CodecError::Frame {
                source: FrameError::PayloadTooShort {
                    expected: 8,
                    actual: data.len(),
                },
            });
        }
        let specifier = data[0];
        let addr = ObjectAddress::new(u16::from_le_bytes([data[1], data[2]]), data[3]);

        if specifier & 0xE0 == 0x80 {
            let code = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
            return Ok(SdoResponse::Abort {
                addr,
                abort_code: RawAbortCode::from_u32(code),
            });
        }

        match specifier >> 5 {
            // confirm download
            0x03 => Ok(SdoResponse::ConfirmDownload { addr }),
            // confirm upload
            0x02 => {
                let mut payload = [0u8; 4];
                payload.copy_from_slice(&data[4..8]);
                let expedited = specifier & 0x02 != 0;
                let len = if expedited {
                    if specifier & 0x01 != 0 {
                        4 - ((specifier >> 2) & 0x03)
                    } else {
                        4
                    }
                } else {
                    // Segmented transfer isn't supported; treat all 4 bytes
                    // as present so callers at least see raw data rather
                    // than an outright decode failure.
                    4
                };
                Ok(SdoResponse::ConfirmUpload {
                    addr,
                    len,
                    data: payload,
                })
            }
            _ => Err(CodecError::UnrecognizedSpecifier { specifier }),
        }
    }
}

/// Errors encoding/decoding SDO frames.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CodecError {
    /// The frame itself was malformed.
    #[snafu(display("frame error: {source}"))]
    Frame {
        /// The underlying frame error.
        source: FrameError,
    },
    /// Expedited transfer only supports 1-4 byte payloads.
    #[snafu(display("unsupported expedited transfer length: {len} bytes"))]
    UnsupportedDataLength {
        /// The rejected length.
        len: usize,
    },
    /// The specifier byte didn't match a known response kind.
    #[snafu(display("unrecognized SDO response specifier {specifier:#x}"))]
    UnrecognizedSpecifier {
        /// The offending byte.
        specifier: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_request_encodes_n_and_e_bits() {
        let req = SdoRequest::download(ObjectAddress::new(0x6040, 0), &[0x0F]).unwrap();
        let frame = req.to_frame(1);
        assert_eq!(frame.id().raw(), 0x601);
        // n = 4-1=3 -> bits 3:2 = 11, e=1, s=1 => 0x2F
        assert_eq!(frame.data(), &[0x2F, 0x40, 0x60, 0x00, 0x0F, 0, 0, 0]);
    }

    #[test]
    fn upload_request_encodes_specifier_0x40() {
        let req = SdoRequest::upload(ObjectAddress::new(0x6041, 0));
        let frame = req.to_frame(1);
        assert_eq!(frame.data(), &[0x40, 0x41, 0x60, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn download_rejects_oversized_payload() {
        assert!(SdoRequest::download(ObjectAddress::new(0, 0), &[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn confirm_upload_decodes_expedited_length() {
        let frame = Frame::new(
            CobId::new(0x581),
            &[0x4B, 0x41, 0x60, 0x00, 0x37, 0x06, 0, 0],
        );
        let resp = SdoResponse::decode(&frame).unwrap();
        match resp {
            SdoResponse::ConfirmUpload { addr, len, data } => {
                assert_eq!(addr, ObjectAddress::new(0x6041, 0));
                assert_eq!(len, 2);
                assert_eq!(&data[..len as usize], &[0x37, 0x06]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn abort_response_decodes_code_and_describes_it() {
        let frame = Frame::new(
            CobId::new(0x581),
            &[0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06],
        );
        let resp = SdoResponse::decode(&frame).unwrap();
        match resp {
            SdoResponse::Abort { addr, abort_code } => {
                assert_eq!(addr, ObjectAddress::new(0x1000, 0));
                assert_eq!(abort_code, RawAbortCode::Known(AbortCode::NoSuchObject));
                assert!(abort_code.to_string().contains("does not exist"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_abort_code_is_classified_by_range() {
        let raw = RawAbortCode::from_u32(0x2FFF_0001);
        assert_eq!(raw, RawAbortCode::Unknown(0x2FFF_0001));
        assert!(raw.to_string().contains("manufacturer-specific"));
    }
}
