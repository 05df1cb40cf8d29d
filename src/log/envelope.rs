//! Event envelope and its stored encoding.

use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::types::{Checksum, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// A stored event: position, time, integrity checksum and payload.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    /// Checksum of the encoded payload, computed at publish time.
    pub checksum: Checksum,
    pub payload: Document,
}

/// On-disk shape of an envelope.
///
/// The payload is kept as the exact JSON bytes the checksum was computed
/// over, so audits never depend on re-encoding.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    sequence: u64,
    timestamp: i64,
    checksum: u64,
    payload: Vec<u8>,
}

impl EventEnvelope {
    /// Encode an envelope around already-encoded payload bytes.
    pub(crate) fn encode_raw(
        sequence: Sequence,
        timestamp: Timestamp,
        checksum: Checksum,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            sequence: sequence.0,
            timestamp: timestamp.0,
            checksum: checksum.0,
            payload: payload.to_vec(),
        };
        Ok(rmp_serde::to_vec(&wire)?)
    }

    /// Encode this envelope for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload.to_bytes()?;
        Self::encode_raw(self.sequence, self.timestamp, self.checksum, &payload)
    }

    /// Decode a stored envelope without checking its checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = rmp_serde::from_slice(bytes)?;
        Self::from_wire(wire)
    }

    /// Decode a stored envelope and check the payload against its checksum.
    pub fn decode_verified(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = rmp_serde::from_slice(bytes)?;
        let actual = Checksum::of(&wire.payload);
        if actual.0 != wire.checksum {
            return Err(EngineError::ChecksumMismatch {
                sequence: Sequence(wire.sequence),
                expected: wire.checksum,
                got: actual.0,
            });
        }
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self> {
        Ok(Self {
            sequence: Sequence(wire.sequence),
            timestamp: Timestamp(wire.timestamp),
            checksum: Checksum(wire.checksum),
            payload: Document::from_bytes(&wire.payload)?,
        })
    }
}
