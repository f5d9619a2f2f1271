use crate::{error::ProtocolError, END_OF_DATA_MARKER};
use serde::de::DeserializeOwned;

/// Interprets the whole accumulated buffer as one JSON document.
///
/// Returns `Ok(None)` while the buffer is not (yet) a complete JSON document,
/// `Ok(Some(_))` once it is and matches `T`, and a validation error when it is
/// complete JSON of the wrong shape. The buffer is only borrowed, so calling
/// this again on the same bytes always yields the same answer.
pub fn parse_document<T: DeserializeOwned>(buffer: &[u8]) -> Result<Option<T>, ProtocolError> {
    let value: serde_json::Value = match serde_json::from_slice(buffer) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::Validation(e.to_string()))
}

/// Offset of the first end-of-data marker, if one has arrived.
pub fn find_end_marker(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(END_OF_DATA_MARKER.len())
        .position(|window| window == END_OF_DATA_MARKER)
}
