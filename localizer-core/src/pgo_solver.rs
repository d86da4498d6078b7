//! Pose graph optimization: Levenberg-Marquardt nonlinear least squares over all node
//! positions, followed by a pure gauge-fixing transform that locks anchors back onto
//! ground truth.
//!
//! Both [`solve`] and [`gauge_fix`] are free functions over plain data — no locking, no
//! shared mutable state, trivially unit-testable in isolation from the coordinator.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use uwb_types::{mean_vec3, AnchorId, Node, TagId, Vec3};

use crate::anchor_geometry::AnchorGeometry;
use crate::edge_builder::Edge;
use crate::error::SolveError;

const GRADIENT_TOL: f64 = 1e-10;
const PARAM_STEP_TOL: f64 = 1e-9;
const INITIAL_LAMBDA: f64 = 1e-3;
const MAX_LAMBDA: f64 = 1e12;

#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutput {
    pub node_positions: BTreeMap<Node, Vec3>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
}

/// Minimize `sum_(u,v,d) || (p[v] - p[u]) - d ||^2` over every node's position, anchors
/// included — gauge fixing happens afterward, as a separate transform.
pub fn solve(
    edges: &[Edge],
    geometry: &AnchorGeometry,
    tag_id: TagId,
    warm_start: Option<Vec3>,
    iteration_cap: usize,
) -> Result<SolveOutput, SolveError> {
    let anchor_tag_edges = edges.iter().filter(|e| matches!(e.to, Node::Tag(_))).count();
    if anchor_tag_edges == 0 && warm_start.is_none() {
        return Err(SolveError::Underconstrained);
    }

    let nodes: Vec<Node> = geometry
        .anchor_ids()
        .map(Node::Anchor)
        .chain(std::iter::once(Node::Tag(tag_id)))
        .collect();
    let index: BTreeMap<Node, usize> = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let n = nodes.len();

    let centroid = centroid_of_anchors(geometry);
    let mut x = DVector::zeros(3 * n);
    for (&node, &i) in &index {
        let p = match node {
            Node::Anchor(id) => geometry.position(id).expect("anchor in geometry"),
            Node::Tag(_) => warm_start.unwrap_or(centroid),
        };
        x[3 * i] = p.x;
        x[3 * i + 1] = p.y;
        x[3 * i + 2] = p.z;
    }

    let mut lambda = INITIAL_LAMBDA;
    let mut iterations_run = 0;
    let mut converged = false;
    let mut residual_norm = 0.0;

    let (mut residual, mut jacobian) = residual_and_jacobian(&x, edges, &index);
    if !residual.iter().all(|v| v.is_finite()) {
        return Err(SolveError::NumericFailure);
    }
    let mut cost = residual.dot(&residual);

    for iter in 0..iteration_cap {
        iterations_run = iter + 1;

        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let jtr = &jt * &residual;

        if jtr.norm() < GRADIENT_TOL {
            converged = true;
            residual_norm = cost.sqrt();
            break;
        }

        let mut step_accepted = false;
        for _ in 0..16 {
            let mut damped = jtj.clone();
            for k in 0..damped.nrows() {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }

            let rhs = -&jtr;
            let delta = match damped.clone().lu().solve(&rhs) {
                Some(d) => d,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };

            if !delta.iter().all(|v| v.is_finite()) {
                return Err(SolveError::NumericFailure);
            }

            let x_candidate = &x + &delta;
            let (candidate_residual, candidate_jacobian) =
                residual_and_jacobian(&x_candidate, edges, &index);
            if !candidate_residual.iter().all(|v| v.is_finite()) {
                return Err(SolveError::NumericFailure);
            }
            let candidate_cost = candidate_residual.dot(&candidate_residual);

            if candidate_cost < cost {
                let step_norm = delta.norm();
                x = x_candidate;
                residual = candidate_residual;
                jacobian = candidate_jacobian;
                cost = candidate_cost;
                lambda = (lambda * 0.7).max(1e-15);
                step_accepted = true;

                if step_norm < PARAM_STEP_TOL || jtr.norm() < GRADIENT_TOL {
                    converged = true;
                }
                break;
            } else {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    break;
                }
            }
        }

        residual_norm = cost.sqrt();

        if !step_accepted {
            return Err(SolveError::NonConvergence);
        }
        if converged {
            break;
        }
    }

    let mut node_positions = BTreeMap::new();
    for (&node, &i) in &index {
        node_positions.insert(node, Vec3::new(x[3 * i], x[3 * i + 1], x[3 * i + 2]));
    }

    Ok(SolveOutput { node_positions, iterations: iterations_run, residual_norm, converged })
}

fn residual_and_jacobian(
    x: &DVector<f64>,
    edges: &[Edge],
    index: &BTreeMap<Node, usize>,
) -> (DVector<f64>, DMatrix<f64>) {
    let n_params = x.len();
    let n_edges = edges.len();
    let mut residual = DVector::zeros(3 * n_edges);
    let mut jacobian = DMatrix::zeros(3 * n_edges, n_params);

    for (e, edge) in edges.iter().enumerate() {
        let iu = index[&edge.from];
        let iv = index[&edge.to];
        let pu = Vector3::new(x[3 * iu], x[3 * iu + 1], x[3 * iu + 2]);
        let pv = Vector3::new(x[3 * iv], x[3 * iv + 1], x[3 * iv + 2]);
        let d = Vector3::new(edge.vector.x, edge.vector.y, edge.vector.z);
        let r = (pv - pu) - d;

        residual[3 * e] = r.x;
        residual[3 * e + 1] = r.y;
        residual[3 * e + 2] = r.z;

        for k in 0..3 {
            jacobian[(3 * e + k, 3 * iu + k)] = -1.0;
            jacobian[(3 * e + k, 3 * iv + k)] += 1.0;
        }
    }

    (residual, jacobian)
}

fn centroid_of_anchors(geometry: &AnchorGeometry) -> Vec3 {
    let positions: Vec<Vec3> = geometry.positions().values().copied().collect();
    mean_vec3(&positions)
}

/// Remove the residual translation/rotation/scale gauge freedom of the anchor-anchor
/// rigid sub-graph: recover the similarity transform that takes the solved anchor
/// positions back onto ground truth (via a Kabsch/Umeyama alignment over all anchors,
/// pinned so that `anchor_3` maps exactly onto its ground truth by construction), apply
/// it to every node including the tag, then overwrite every anchor slot with its exact
/// ground-truth position.
pub fn gauge_fix(output: &SolveOutput, geometry: &AnchorGeometry) -> SolveOutput {
    let pivot_id = AnchorId(3);
    let pivot_star = output
        .node_positions
        .get(&Node::Anchor(pivot_id))
        .copied()
        .unwrap_or(Vec3::ZERO);
    let pivot_gt = geometry.position(pivot_id).unwrap_or(Vec3::ZERO);

    let anchor_ids: Vec<AnchorId> = geometry.anchor_ids().collect();
    let src_centered: Vec<Vector3<f64>> = anchor_ids
        .iter()
        .map(|&id| {
            let p = output.node_positions.get(&Node::Anchor(id)).copied().unwrap_or(pivot_star);
            Vector3::new(p.x - pivot_star.x, p.y - pivot_star.y, p.z - pivot_star.z)
        })
        .collect();
    let dst_centered: Vec<Vector3<f64>> = anchor_ids
        .iter()
        .map(|&id| {
            let p = geometry.position(id).unwrap_or(pivot_gt);
            Vector3::new(p.x - pivot_gt.x, p.y - pivot_gt.y, p.z - pivot_gt.z)
        })
        .collect();

    let (scale, rotation) = kabsch_similarity(&src_centered, &dst_centered);

    let transform = |p: Vec3| -> Vec3 {
        let centered = Vector3::new(p.x - pivot_star.x, p.y - pivot_star.y, p.z - pivot_star.z);
        let rotated = rotation * centered * scale;
        Vec3::new(rotated.x + pivot_gt.x, rotated.y + pivot_gt.y, rotated.z + pivot_gt.z)
    };

    let mut node_positions: BTreeMap<Node, Vec3> = output
        .node_positions
        .iter()
        .map(|(&node, &p)| (node, transform(p)))
        .collect();

    for &id in &anchor_ids {
        if let Some(gt) = geometry.position(id) {
            node_positions.insert(Node::Anchor(id), gt);
        }
    }

    SolveOutput {
        node_positions,
        iterations: output.iterations,
        residual_norm: output.residual_norm,
        converged: output.converged,
    }
}

/// Umeyama's method restricted to rotation + uniform scale (no reflection): returns
/// `(scale, rotation)` minimizing `sum || scale * rotation * src_i - dst_i ||^2` over the
/// already-centered point correspondences.
fn kabsch_similarity(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> (f64, Matrix3<f64>) {
    let n = src.len().max(1) as f64;
    let mut h = Matrix3::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        h += d * s.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.unwrap_or_else(Matrix3::identity);
    let v_t = svd.v_t.unwrap_or_else(Matrix3::identity);

    let det_sign = (u.determinant() * v_t.determinant()).signum();
    let last = if det_sign < 0.0 { -1.0 } else { 1.0 };
    let d = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, last));
    let rotation = u * d * v_t;

    let src_variance: f64 = src.iter().map(|s| s.norm_squared()).sum::<f64>() / n;
    let singular_values = svd.singular_values;
    let scale_numerator = singular_values[0] * d[(0, 0)]
        + singular_values[1] * d[(1, 1)]
        + singular_values[2] * d[(2, 2)];
    let scale = if src_variance > 1e-12 { (scale_numerator / n) / src_variance } else { 1.0 };

    (scale, rotation)
}
