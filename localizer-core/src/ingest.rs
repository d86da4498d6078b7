//! Measurement ingest: turns a raw per-anchor wire payload into a validated
//! [`Measurement`], or a counted, discarded [`IngestError`].
//!
//! This module holds no buffering state of its own — acceptance into the sliding window
//! is the binner's job (see [`crate::binner`]). Ingest only parses, validates, and tags.

use std::sync::atomic::{AtomicU64, Ordering};

use uwb_types::{AnchorId, Measurement, TagId, Timestamp, Vec3};

use crate::anchor_geometry::AnchorGeometry;
use crate::error::IngestError;

/// Twice the room diagonal for a generously-sized indoor space is a safe, finite upper
/// bound on any plausible vector magnitude; anything past this is corrupt, not just noisy.
const MAX_VECTOR_MAGNITUDE_CM: f64 = 4_000.0;

/// Per-category drop counters, the only observable side effect of a failed ingest.
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub invalid_payload: AtomicU64,
    pub unknown_anchor: AtomicU64,
    pub invalid_vector: AtomicU64,
    pub transport_error: AtomicU64,
}

impl IngestCounters {
    pub fn record(&self, err: &IngestError) {
        let counter = match err {
            IngestError::InvalidPayload(_) => &self.invalid_payload,
            IngestError::UnknownAnchor(_) => &self.unknown_anchor,
            IngestError::InvalidVector => &self.invalid_vector,
            IngestError::TransportError(_) => &self.transport_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestCounterSnapshot {
        IngestCounterSnapshot {
            invalid_payload: self.invalid_payload.load(Ordering::Relaxed),
            unknown_anchor: self.unknown_anchor.load(Ordering::Relaxed),
            invalid_vector: self.invalid_vector.load(Ordering::Relaxed),
            transport_error: self.transport_error.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestCounterSnapshot {
    pub invalid_payload: u64,
    pub unknown_anchor: u64,
    pub invalid_vector: u64,
    pub transport_error: u64,
}

/// Parse and validate one raw `(anchor_id, json_bytes)` delivery into a `Measurement`
/// tagged for `tag_id` (the current core assumes one active tag slot per anchor feed).
/// `payload` is exactly the wire shape from the external-interfaces contract:
/// `{t_unix_ns, vector_local}` — not a transport-specific envelope.
pub fn parse_measurement_bytes(
    raw_anchor_id: u8,
    tag_id: TagId,
    payload: &[u8],
    geometry: &AnchorGeometry,
) -> Result<Measurement, IngestError> {
    let parsed: uwb_types::AnchorVectorPayload = serde_json::from_slice(payload)
        .map_err(|e| IngestError::InvalidPayload(e.to_string()))?;
    validate_and_build(raw_anchor_id, tag_id, parsed, geometry)
}

/// Shared validation path for a payload a transport has already deserialized (used by
/// [`crate::bus::MessageBus`] implementations that parse their own envelope directly).
pub fn validate_and_build(
    raw_anchor_id: u8,
    tag_id: TagId,
    parsed: uwb_types::AnchorVectorPayload,
    geometry: &AnchorGeometry,
) -> Result<Measurement, IngestError> {
    let anchor_id = AnchorId(raw_anchor_id);
    if !geometry.contains(anchor_id) {
        return Err(IngestError::UnknownAnchor(raw_anchor_id));
    }

    validate_vector(parsed.vector_local)?;

    Ok(Measurement {
        timestamp: Timestamp::from_unix_nanos(parsed.t_unix_ns),
        anchor_id,
        tag_id,
        local_vector: parsed.vector_local,
    })
}

fn validate_vector(v: Vec3) -> Result<(), IngestError> {
    if !v.is_finite() {
        return Err(IngestError::InvalidVector);
    }
    if v.norm() > MAX_VECTOR_MAGNITUDE_CM {
        return Err(IngestError::InvalidVector);
    }
    Ok(())
}
