//! Errors surfaced by [`super::client::SdoClient`].

use snafu::Snafu;
use std::time::Duration;

use super::codec::{ObjectAddress, RawAbortCode};

/// Error returned by [`super::client::SdoClient`] operations.
#[derive(Debug, Snafu, PartialEq)]
pub enum SdoClientError {
    /// No response arrived before the deadline.
    #[snafu(display("SDO request to 0x{:x}sub{} timed out after {elapsed:?}", addr.index, addr.sub))]
    Timeout {
        /// The object that was being accessed.
        addr: ObjectAddress,
        /// How long the client waited.
        elapsed: Duration,
    },
    /// A request is already outstanding for this object.
    #[snafu(display("a request for 0x{:x}sub{} is already in flight", addr.index, addr.sub))]
    RequestInFlight {
        /// The object already pending.
        addr: ObjectAddress,
    },
    /// The server responded with an abort.
    #[snafu(display("server aborted access to 0x{:x}sub{}: {abort_code}", addr.index, addr.sub))]
    ServerAbort {
        /// The object the abort applies to.
        addr: ObjectAddress,
        /// The reason given.
        abort_code: RawAbortCode,
    },
    /// The caller's cancellation signal fired before a response arrived.
    #[snafu(display("request for 0x{:x}sub{} was cancelled", addr.index, addr.sub))]
    Cancelled {
        /// The object that was being accessed.
        addr: ObjectAddress,
    },
    /// An uploaded string object was not valid UTF-8.
    #[snafu(display("object 0x{:x}sub{} is not valid UTF-8", addr.index, addr.sub))]
    InvalidUtf8 {
        /// The object that was read.
        addr: ObjectAddress,
    },
    /// Upload/download was given data of an unsupported length.
    #[snafu(display("unsupported SDO transfer length: {len} bytes (expedited transfer supports 1-4)"))]
    UnsupportedLength {
        /// The rejected length.
        len: usize,
    },
    /// The transport rejected the send.
    SendFailed,
    /// The response was a confirmation of the wrong kind of operation
    /// (e.g. a download confirm when an upload was requested).
    #[snafu(display("unexpected response kind for 0x{:x}sub{}", addr.index, addr.sub))]
    UnexpectedResponseKind {
        /// The object that was being accessed.
        addr: ObjectAddress,
    },
}

pub type Result<T> = std::result::Result<T, SdoClientError>;
