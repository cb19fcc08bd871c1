use serde_json::{Map, Value};
use thiserror::Error;

/// One schema-less report as published upstream: a JSON object with
/// arbitrary keys and values. Key order is preserved.
pub type Report = Map<String, Value>;

#[derive(Debug, Error)]
#[error("payload is not a JSON object: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Decode a queue payload into a report. No validation beyond "is a JSON object".
pub fn decode(payload: &[u8]) -> Result<Report, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}
