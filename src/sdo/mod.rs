//! Expedited SDO (Service Data Object) request/response engine.

pub mod client;
pub mod codec;
pub mod error;

pub use client::SdoClient;
pub use codec::{AbortCode, ObjectAddress, RawAbortCode, SdoRequest, SdoResponse};
pub use error::SdoClientError;
