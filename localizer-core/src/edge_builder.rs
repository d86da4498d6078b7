//! Converts a [`Bin`] plus [`AnchorGeometry`] into the edge set the PGO solver consumes.
//!
//! Produces the fixed 12-edge anchor-anchor rigid sub-graph verbatim, plus one averaged
//! anchor-tag edge per anchor that contributed to the bin.

use uwb_types::{mean_vec3, Node, Vec3};

use crate::anchor_geometry::AnchorGeometry;
use crate::binner::Bin;

/// An asserted relative-displacement constraint between two pose-graph nodes, in the
/// global frame: `vector == to - from`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub from: Node,
    pub to: Node,
    pub vector: Vec3,
}

/// Build the edge set for one solve tick. Never emits an anchor-tag edge for an anchor
/// with zero measurements in the bin; an underconstrained tag (fewer than two
/// contributing anchors) still gets whatever edges are available — the caller surfaces
/// the edge count as a quality metric rather than treating it as a hard failure.
pub fn build_edges(bin: &Bin, geometry: &AnchorGeometry) -> Vec<Edge> {
    let mut edges = Vec::with_capacity(geometry.anchor_edges().len() + bin.per_anchor.len());

    for e in geometry.anchor_edges() {
        edges.push(Edge {
            from: Node::Anchor(e.from),
            to: Node::Anchor(e.to),
            vector: e.vector,
        });
    }

    for (&anchor_id, local_vectors) in &bin.per_anchor {
        if local_vectors.is_empty() {
            continue;
        }
        let avg_local = mean_vec3(local_vectors);
        let Some(global) = geometry.to_global(anchor_id, avg_local) else {
            continue;
        };
        edges.push(Edge {
            from: Node::Anchor(anchor_id),
            to: Node::Tag(bin.tag_id),
            vector: global,
        });
    }

    edges
}

/// Number of distinct anchors that contributed at least one anchor-tag edge — the
/// underconstrained-tag quality metric.
pub fn anchor_tag_edge_count(edges: &[Edge]) -> usize {
    edges.iter().filter(|e| matches!(e.to, Node::Tag(_))).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnchorEntry, AnchorsConfig};
    use std::collections::BTreeMap;
    use uwb_types::{AnchorId, TagId, Timestamp};

    fn geometry() -> AnchorGeometry {
        AnchorGeometry::from_config(&AnchorsConfig {
            entries: vec![
                AnchorEntry { id: 0, position: [0.0, 0.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                AnchorEntry { id: 1, position: [480.0, 0.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                AnchorEntry { id: 2, position: [480.0, 600.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
                AnchorEntry { id: 3, position: [0.0, 600.0, 0.0], yaw_deg: 0.0, tilt_deg: 0.0 },
            ],
        })
        .unwrap()
    }

    #[test]
    fn includes_all_twelve_anchor_edges_verbatim() {
        let geo = geometry();
        let mut per_anchor = BTreeMap::new();
        per_anchor.insert(AnchorId(0), vec![Vec3::new(1.0, 1.0, 1.0)]);
        let bin = Bin { tag_id: TagId(0), start_ts: Timestamp(0.0), end_ts: Timestamp(0.0), per_anchor };

        let edges = build_edges(&bin, &geo);
        let anchor_anchor: Vec<_> = edges
            .iter()
            .filter(|e| matches!((e.from, e.to), (Node::Anchor(_), Node::Anchor(_))))
            .collect();
        assert_eq!(anchor_anchor.len(), 12);
        for e in &anchor_anchor {
            let Node::Anchor(from) = e.from else { unreachable!() };
            let Node::Anchor(to) = e.to else { unreachable!() };
            assert_eq!(e.vector, geo.position(to).unwrap() - geo.position(from).unwrap());
        }
    }

    #[test]
    fn skips_anchors_with_no_measurements() {
        let geo = geometry();
        let mut per_anchor = BTreeMap::new();
        per_anchor.insert(AnchorId(0), vec![Vec3::new(240.0, 300.0, 0.0)]);
        let bin = Bin { tag_id: TagId(0), start_ts: Timestamp(0.0), end_ts: Timestamp(0.0), per_anchor };

        let edges = build_edges(&bin, &geo);
        assert_eq!(anchor_tag_edge_count(&edges), 1);
    }

    #[test]
    fn averages_multiple_local_vectors_before_rotating() {
        let geo = geometry();
        let mut per_anchor = BTreeMap::new();
        per_anchor.insert(AnchorId(0), vec![Vec3::new(238.0, 298.0, 0.0), Vec3::new(242.0, 302.0, 0.0)]);
        let bin = Bin { tag_id: TagId(0), start_ts: Timestamp(0.0), end_ts: Timestamp(0.0), per_anchor };

        let edges = build_edges(&bin, &geo);
        let tag_edge = edges.iter().find(|e| matches!(e.to, Node::Tag(_))).unwrap();
        assert!((tag_edge.vector.x - 240.0).abs() < 1e-9);
        assert!((tag_edge.vector.y - 300.0).abs() < 1e-9);
    }
}
