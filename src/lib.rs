//! An async CANopen (CiA 301) client stack.
//!
//! This crate implements the core application-layer protocols used to
//! configure and drive CANopen nodes from a master: expedited SDO
//! read/write, NMT commands, the SYNC producer, the Heartbeat and
//! Emergency consumers, and PDO mapping/bit-packing. It does not include a
//! concrete CAN hardware driver; [`transport::AsyncCanSender`],
//! [`transport::AsyncCanReceiver`], and [`transport::Connection`] are the
//! seam a driver plugs into.
//!
//! [`device::Device`] is the usual entry point: it binds a node id to one
//! instance of every service.

#![warn(missing_docs, missing_debug_implementations)]

pub mod device;
pub mod emcy;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;
pub mod transport;

pub use device::Device;
pub use error::ValidationError;
pub use frame::{CobId, EmergencyFrame, Frame, Heartbeat, NmtCommand, NmtState, Sync as SyncFrame};
