//! Process-wide, read-only anchor geometry: ground-truth positions, the local→global
//! rotation for each anchor, and the fixed 12-edge anchor-anchor rigid sub-graph.
//!
//! Built once at startup from [`AnchorsConfig`](crate::config::AnchorsConfig) and passed
//! around by reference — there is no module-level mutable global here.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Vector3};
use uwb_types::{AnchorId, Vec3};

use crate::config::AnchorsConfig;
use crate::error::InitError;

const COLLINEARITY_EPS: f64 = 1e-6;

/// One ordered anchor-anchor constraint: the global-frame displacement `positions[j] -
/// positions[i]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorEdge {
    pub from: AnchorId,
    pub to: AnchorId,
    pub vector: Vec3,
}

#[derive(Debug, Clone)]
pub struct AnchorGeometry {
    positions: BTreeMap<AnchorId, Vec3>,
    rotations: BTreeMap<AnchorId, Matrix3<f64>>,
    anchor_edges: Vec<AnchorEdge>,
}

impl AnchorGeometry {
    /// Build geometry from the four-entry anchor configuration. Fatal on a missing
    /// anchor, a non-orthonormal rotation, or a degenerate (collinear) layout — none of
    /// these are recoverable once the process is running.
    pub fn from_config(cfg: &AnchorsConfig) -> Result<Self, InitError> {
        if cfg.entries.is_empty() {
            return Err(InitError::BadAnchorGeometry("no anchors configured".into()));
        }

        let mut positions = BTreeMap::new();
        let mut rotations = BTreeMap::new();

        for entry in &cfg.entries {
            let id = AnchorId(entry.id);
            if positions.contains_key(&id) {
                return Err(InitError::BadAnchorGeometry(format!(
                    "duplicate anchor id {}",
                    entry.id
                )));
            }
            let [x, y, z] = entry.position;
            let pos = Vec3::new(x, y, z);
            if !pos.is_finite() {
                return Err(InitError::BadAnchorGeometry(format!(
                    "anchor {} has a non-finite position",
                    entry.id
                )));
            }

            let rotation = yaw_tilt_rotation(entry.yaw_deg, entry.tilt_deg);
            check_orthonormal(&rotation).map_err(|e| {
                InitError::BadAnchorGeometry(format!("anchor {}: {e}", entry.id))
            })?;

            positions.insert(id, pos);
            rotations.insert(id, rotation);
        }

        check_non_degenerate(&positions)?;

        let anchor_edges = build_anchor_edges(&positions);

        Ok(Self { positions, rotations, anchor_edges })
    }

    pub fn positions(&self) -> &BTreeMap<AnchorId, Vec3> {
        &self.positions
    }

    pub fn position(&self, id: AnchorId) -> Option<Vec3> {
        self.positions.get(&id).copied()
    }

    pub fn rotation(&self, id: AnchorId) -> Option<&Matrix3<f64>> {
        self.rotations.get(&id)
    }

    /// Rotate a local-frame vector into the global frame for the given anchor.
    pub fn to_global(&self, id: AnchorId, local: Vec3) -> Option<Vec3> {
        let r = self.rotations.get(&id)?;
        let v = r * Vector3::new(local.x, local.y, local.z);
        Some(Vec3::new(v.x, v.y, v.z))
    }

    pub fn anchor_edges(&self) -> &[AnchorEdge] {
        &self.anchor_edges
    }

    pub fn anchor_ids(&self) -> impl Iterator<Item = AnchorId> + '_ {
        self.positions.keys().copied()
    }

    pub fn contains(&self, id: AnchorId) -> bool {
        self.positions.contains_key(&id)
    }
}

/// `R = Rz(yaw) * Ry(tilt)`. `tilt_deg`'s sign is a per-anchor calibration parameter —
/// this function never hardcodes which physical direction "down" is; the caller's
/// configuration supplies the signed angle.
fn yaw_tilt_rotation(yaw_deg: f64, tilt_deg: f64) -> Matrix3<f64> {
    let yaw = yaw_deg.to_radians();
    let tilt = tilt_deg.to_radians();

    let rz = Matrix3::new(
        yaw.cos(), -yaw.sin(), 0.0,
        yaw.sin(), yaw.cos(), 0.0,
        0.0, 0.0, 1.0,
    );
    let ry = Matrix3::new(
        tilt.cos(), 0.0, tilt.sin(),
        0.0, 1.0, 0.0,
        -tilt.sin(), 0.0, tilt.cos(),
    );
    rz * ry
}

fn check_orthonormal(r: &Matrix3<f64>) -> Result<(), String> {
    let should_be_identity = r.transpose() * r;
    let identity = Matrix3::identity();
    let max_dev = (should_be_identity - identity).abs().max();
    if max_dev > 1e-8 {
        return Err(format!("rotation matrix is not orthonormal (max deviation {max_dev:e})"));
    }
    if (r.determinant() - 1.0).abs() > 1e-8 {
        return Err("rotation matrix determinant is not 1 (reflection, not rotation)".into());
    }
    Ok(())
}

/// Reject a layout where all anchors are collinear — the anchor-anchor rigid sub-graph
/// would then be unable to fix more than one rotational degree of freedom.
fn check_non_degenerate(positions: &BTreeMap<AnchorId, Vec3>) -> Result<(), InitError> {
    let pts: Vec<Vector3<f64>> = positions.values().map(|p| Vector3::new(p.x, p.y, p.z)).collect();
    if pts.len() < 2 {
        return Err(InitError::BadAnchorGeometry("fewer than two anchors configured".into()));
    }
    let origin = pts[0];
    let mut spread = nalgebra::Matrix3xX::<f64>::zeros(pts.len() - 1);
    for (col, p) in pts[1..].iter().enumerate() {
        let edge = p - origin;
        spread.set_column(col, &edge);
    }
    let svd = spread.svd(false, false);
    let rank = svd.singular_values.iter().filter(|s| **s > COLLINEARITY_EPS).count();
    if rank < 2 {
        return Err(InitError::BadAnchorGeometry(
            "anchor layout is degenerate (all anchors collinear)".into(),
        ));
    }
    Ok(())
}

fn build_anchor_edges(positions: &BTreeMap<AnchorId, Vec3>) -> Vec<AnchorEdge> {
    let mut edges = Vec::with_capacity(positions.len() * (positions.len() - 1));
    for (&i, &pi) in positions {
        for (&j, &pj) in positions {
            if i == j {
                continue;
            }
            edges.push(AnchorEdge { from: i, to: j, vector: pj - pi });
        }
    }
    edges
}
