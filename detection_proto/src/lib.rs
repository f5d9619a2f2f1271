//! Wire envelopes and framing shared by the detection service and its clients.
//!
//! A connection carries exactly one request and one response. Requests are a
//! single JSON document (or, for legacy senders, raw image bytes followed by
//! [`END_OF_DATA_MARKER`]); responses are a single JSON document whose end is
//! signalled only by the service closing the connection.

mod envelope;
mod error;
mod framing;

pub use envelope::{
    now_timestamp, DetectionFailure, DetectionRequest, DetectionResponse, DetectionSuccess,
    ImageDetection, Prediction,
};
pub use error::{ErrorKind, ProtocolError};
pub use framing::{find_end_marker, parse_document};

/// Literal byte sequence terminating a raw-binary legacy request.
pub const END_OF_DATA_MARKER: &[u8] = b"\n<<END_OF_DATA>>\n";

/// Socket path used when no configuration overrides it.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/volcom_unix_socket";
