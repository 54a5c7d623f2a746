use std::fmt::{self, Display};

use simba::simd::SimdValue as _;

use crate::util::Stats;

use super::{NodeIdx, NodeLink, Qbvh, QuadIdxRange};

/// Shape of a built tree.
#[derive(Clone, Debug, PartialEq)]
pub struct QbvhStatistics {
    /// Number of links followed from the root to each leaf
    pub depth: Stats,
    /// Non-empty child slots per node
    pub node_fill: Stats,
    /// Triangles per leaf, padding lanes not counted
    pub leaf_fill: Stats,
    pub node_count: usize,
    pub quad_count: usize,
}

impl Display for QbvhStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nodes: {}, quads: {}", self.node_count, self.quad_count)?;
        writeln!(f, "Depth: {}", self.depth)?;
        writeln!(f, "Node child count: {}", self.node_fill)?;
        write!(f, "Leaf triangle count: {}", self.leaf_fill)
    }
}

impl Qbvh {
    pub fn statistics(&self) -> QbvhStatistics {
        let mut stats = QbvhStatistics {
            depth: Stats::default(),
            node_fill: self
                .nodes
                .iter()
                .map(|node| node.child_links.iter().filter(|l| !l.is_null()).count())
                .collect(),
            leaf_fill: Stats::default(),
            node_count: self.nodes.len(),
            quad_count: self.quads.len(),
        };
        self.leaf_statistics_recursive(NodeIdx::from_raw(0), 1, &mut stats);
        stats
    }

    fn leaf_statistics_recursive(&self, node: NodeIdx, depth: usize, stats: &mut QbvhStatistics) {
        for link in &self.nodes[node].child_links {
            match link.decode() {
                NodeLink::Null => {}
                NodeLink::Inner { index } => self.leaf_statistics_recursive(index, depth + 1, stats),
                NodeLink::Leaf { quads } => {
                    stats.depth.add_sample(depth);
                    stats.leaf_fill.add_sample(self.leaf_triangle_count(quads));
                }
            }
        }
    }

    fn leaf_triangle_count(&self, quads: QuadIdxRange) -> usize {
        self.quads[quads.into_range()]
            .iter()
            .map(|quad| quad.used_lanes())
            .sum()
    }

    /// Indented listing of every node and leaf, for debugging small trees.
    pub fn tree_dump(&self) -> TreeDump<'_> {
        TreeDump(self)
    }
}

pub struct TreeDump<'a>(&'a Qbvh);

impl TreeDump<'_> {
    fn fmt_recursive(&self, f: &mut fmt::Formatter<'_>, node: NodeIdx, indent: usize) -> fmt::Result {
        let qbvh = self.0;
        let node = &qbvh.nodes[node];
        let indent_str = "  ".repeat(indent);

        for (slot, link) in node.child_links.iter().enumerate() {
            let bounds = node.child_bounds.extract(slot);
            match link.decode() {
                NodeLink::Null => writeln!(f, "{indent_str}- {slot}: <EMPTY>")?,
                NodeLink::Inner { index } => {
                    writeln!(
                        f,
                        "{indent_str}- {slot}: I{}: {:?}-{:?}",
                        index.raw(),
                        bounds.min,
                        bounds.max
                    )?;
                    self.fmt_recursive(f, index, indent + 1)?;
                }
                NodeLink::Leaf { quads } => {
                    writeln!(
                        f,
                        "{indent_str}- {slot}: L{}+{}: {:?}-{:?}",
                        quads.first.raw(),
                        quads.count,
                        bounds.min,
                        bounds.max
                    )?;
                    for quad in &qbvh.quads[quads.into_range()] {
                        let triangles = &quad.triangles()[..quad.used_lanes()];
                        writeln!(f, "{indent_str}    {:?}", triangles)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Display for TreeDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bounds = self.0.bounding_box;
        writeln!(f, "QBVH {:?}-{:?}", bounds.min, bounds.max)?;
        self.fmt_recursive(f, NodeIdx::from_raw(0), 0)
    }
}
