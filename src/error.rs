#![forbid(unsafe_code)]

// Error taxonomy surfaced to signaling clients

use thiserror::Error;

/// Errors reported back to the requesting client in an acknowledgment.
///
/// Every variant renders to a single human-readable string; the wire contract
/// carries no structured error codes. Worker death is not represented here —
/// it is fatal to the process and never reaches a client reply.
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Missing or malformed input from the client.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    /// Referenced room/peer/transport/producer/consumer does not exist or is
    /// not owned by the requester.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists (peer id already present in the room).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The media engine refused the operation (codec mismatch, producer not
    /// consumable with the reported capabilities, transport re-connect).
    #[error("engine rejected: {0}")]
    EngineRejected(String),

    /// The engine call errored or timed out.
    #[error("engine failed: {0}")]
    EngineFailed(String),
}

pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_single_string() {
        let err = SignalingError::NotFound("transport abc".to_string());
        assert_eq!(err.to_string(), "not found: transport abc");

        let err = SignalingError::Conflict("peer \"a\" already in room \"r1\"".to_string());
        assert!(err.to_string().starts_with("conflict: "));
    }
}
