//! # uwb-types
//!
//! Shared wire and domain types for the indoor UWB localization coordinator.
//!
//! These types are used by:
//! - `localizer-core`: ingesting, binning, and fusing per-anchor vector reports
//! - any external anchor firmware / message-bus producer that speaks the wire format
//!   below (out of scope for this workspace — characterized here only by its payload)
//!
//! ## Coordinate conventions
//!
//! - **Local frame**: an anchor's sensor coordinate system; axes depend on its mounted
//!   yaw and tilt.
//! - **Global frame**: the room coordinate system; anchor ground-truth positions are
//!   specified here. All internal units are centimeters.
//!
//! ## Node identifiers
//!
//! Node identifiers are a tagged sum rather than strings like `"anchor_3"` — this keeps
//! string parsing out of the hot path and gives node ids cheap equality, hashing, and
//! serialization.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Scalar ids ─────────────────────────────────────────────────────────────────

/// Identifies one of the (typically four) fixed UWB anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AnchorId(pub u8);

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "anchor_{}", self.0)
    }
}

/// Identifies the mobile tag being localized. The current coordinator assumes a single
/// active tag slot per deployment, but the id is carried through from ingest onward so a
/// small fixed set of tags can share the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagId(pub u32);

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag_{}", self.0)
    }
}

/// A pose-graph node: either one of the fixed anchors or one tag.
///
/// Replaces the duck-typed string labels (`"anchor_3"`, `"phone_0"`) that a naive port
/// would carry through from a dynamically-typed source — equality, hashing, and
/// serialization are all derived instead of string-parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Node {
    Anchor(AnchorId),
    Tag(TagId),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Anchor(a) => write!(f, "{a}"),
            Node::Tag(t) => write!(f, "{t}"),
        }
    }
}

// ── Timestamp ──────────────────────────────────────────────────────────────────

/// Seconds since a fixed monotonic epoch, synchronized across hosts by an external
/// time-sync collaborator. Every measurement, bin, and solution carries one.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp(pub f64);

impl Timestamp {
    /// Convert a wire `t_unix_ns` (nanoseconds since Unix epoch) into a `Timestamp`.
    pub fn from_unix_nanos(ns: u64) -> Self {
        Timestamp(ns as f64 / 1_000_000_000.0)
    }

    pub fn seconds(self) -> f64 {
        self.0
    }
}

impl std::ops::Sub for Timestamp {
    type Output = f64;
    fn sub(self, rhs: Timestamp) -> f64 {
        self.0 - rhs.0
    }
}

// ── Vec3 ───────────────────────────────────────────────────────────────────────

/// A triple of finite floating-point scalars, in centimeters throughout the core.
/// Non-finite components are rejected at ingest — every `Vec3` that survives
/// [`Vec3::is_finite`] can be trusted downstream without re-checking.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn dist(&self, other: &Vec3) -> f64 {
        (*self - *other).norm()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl std::ops::Div<f64> for Vec3 {
    type Output = Vec3;
    fn div(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

/// Sum a sequence of vectors and divide by its length. Panics on an empty slice — callers
/// (the edge builder) only ever average a non-empty per-anchor measurement run.
pub fn mean_vec3(values: &[Vec3]) -> Vec3 {
    assert!(!values.is_empty(), "mean_vec3 called with no samples");
    let sum = values.iter().fold(Vec3::ZERO, |acc, v| acc + *v);
    sum / values.len() as f64
}

// ── Measurement ────────────────────────────────────────────────────────────────

/// One per-anchor vector report, immutable once ingested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub timestamp: Timestamp,
    pub anchor_id: AnchorId,
    pub tag_id: TagId,
    /// Vector from the anchor to the tag, in that anchor's sensor-local frame.
    pub local_vector: Vec3,
}

// ── Wire envelope (inbound: anchor → bus → ingest) ──────────────────────────────

/// JSON payload published on `<base>/anchor/<anchor_id>/vector`.
///
/// `t_unix_ns` is nanoseconds since the Unix epoch; `vector_local` is in centimeters,
/// matching the core's internal units. Unknown fields are ignored (no
/// `deny_unknown_fields`).
#[derive(Debug, Clone, Deserialize)]
pub struct AnchorVectorPayload {
    pub t_unix_ns: u64,
    pub vector_local: Vec3,
}

/// JSON payload published (optionally) on `<base>/tag/<tag_id>/position` after each
/// successful solve.
#[derive(Debug, Clone, Serialize)]
pub struct PositionBroadcast {
    pub t_unix_ns: u64,
    pub position_global: Vec3,
    pub residual: f64,
    pub converged: bool,
    pub n_anchor_edges_used: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec3_rejects_non_finite() {
        assert!(Vec3::new(1.0, 2.0, 3.0).is_finite());
        assert!(!Vec3::new(f64::NAN, 0.0, 0.0).is_finite());
        assert!(!Vec3::new(0.0, f64::INFINITY, 0.0).is_finite());
    }

    #[test]
    fn mean_vec3_averages_componentwise() {
        let samples = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(2.0, 4.0, 6.0)];
        let m = mean_vec3(&samples);
        assert_eq!(m, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn timestamp_from_unix_nanos() {
        let ts = Timestamp::from_unix_nanos(1_500_000_000);
        assert!((ts.seconds() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn node_display_matches_legacy_string_labels() {
        assert_eq!(Node::Anchor(AnchorId(3)).to_string(), "anchor_3");
        assert_eq!(Node::Tag(TagId(0)).to_string(), "tag_0");
    }
}
