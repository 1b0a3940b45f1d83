use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::SharedStr;

/// The hierarchy every loader produces, consumed uniformly by tree
/// renderers regardless of which aggregator built it.
///
/// ```text
///   hotshot event log ─┐
///   pstats dump        ├─▶ CallGraph   ─┐
///   meliae dump ─────────▶ MemoryTree  ─┼─▶ TreeModel ──▶ squaremap / list views
///   speedscope ──────────▶ StackTree   ─┘
/// ```
///
/// Node handles are cheap `Copy` ids into the model's own storage. The
/// graph behind a model is not required to be a tree: call graphs contain
/// recursion and memory trees share children between owners, so consumers
/// walking `children` must guard against revisiting nodes.
pub trait TreeModel {
    type NodeId: Copy + Eq + Hash + Debug;

    /// The single top-level node (synthetic when the data has several roots).
    fn root(&self) -> Self::NodeId;

    fn children(&self, node: Self::NodeId) -> Vec<Self::NodeId>;

    fn parents(&self, node: Self::NodeId) -> Vec<Self::NodeId>;

    /// Cost including all descendants.
    fn cumulative(&self, node: Self::NodeId) -> f64;

    /// Cost attributed directly to the node.
    fn local(&self, node: Self::NodeId) -> f64;

    /// Stable, human-readable identity of the node.
    fn label(&self, node: Self::NodeId) -> String;

    fn unit(&self) -> ValueUnit;

    /// The part of `parent`'s cumulative value attributable to `child`.
    ///
    /// Defaults to the child's whole cumulative value; models with shared
    /// children or per-edge timings override it.
    fn child_value(&self, parent: Self::NodeId, child: Self::NodeId) -> f64 {
        let _ = parent;
        self.cumulative(child)
    }
}

/// Input format a model was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFormat {
    Hotshot,
    PStats,
    Meliae,
    Speedscope,
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hotshot => write!(f, "hotshot"),
            Self::PStats => write!(f, "pstats"),
            Self::Meliae => write!(f, "meliae"),
            Self::Speedscope => write!(f, "speedscope"),
        }
    }
}

/// What the numerical values of a model represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
    /// Sample count (py-spy without weights).
    Samples,
    Bytes,
    /// Arbitrary weight (speedscope `none` unit).
    Weight,
}

impl ValueUnit {
    /// Map a speedscope `unit` string to a value unit.
    pub fn from_speedscope(unit: &str) -> Self {
        match unit {
            "seconds" => Self::Seconds,
            "milliseconds" => Self::Milliseconds,
            "microseconds" => Self::Microseconds,
            "nanoseconds" => Self::Nanoseconds,
            "bytes" => Self::Bytes,
            _ => Self::Weight,
        }
    }

    /// Format a value in this unit for display.
    pub fn format_value(&self, value: f64) -> String {
        match self {
            Self::Seconds => format!("{value:.3}s"),
            Self::Milliseconds => {
                if value >= 1_000.0 {
                    format!("{:.2}s", value / 1_000.0)
                } else {
                    format!("{value:.1}ms")
                }
            }
            Self::Microseconds => {
                if value >= 1_000_000.0 {
                    format!("{:.2}s", value / 1_000_000.0)
                } else if value >= 1_000.0 {
                    format!("{:.1}ms", value / 1_000.0)
                } else {
                    format!("{value:.0}µs")
                }
            }
            Self::Nanoseconds => {
                if value >= 1_000_000_000.0 {
                    format!("{:.2}s", value / 1_000_000_000.0)
                } else if value >= 1_000_000.0 {
                    format!("{:.1}ms", value / 1_000_000.0)
                } else {
                    format!("{value:.0}ns")
                }
            }
            Self::Samples => format!("{} samples", value.round() as u64),
            Self::Bytes => {
                if value >= 1_073_741_824.0 {
                    format!("{:.1} GiB", value / 1_073_741_824.0)
                } else if value >= 1_048_576.0 {
                    format!("{:.1} MiB", value / 1_048_576.0)
                } else if value >= 1_024.0 {
                    format!("{:.1} KiB", value / 1_024.0)
                } else {
                    format!("{} B", value.round() as u64)
                }
            }
            Self::Weight => format!("{value:.0}"),
        }
    }

    /// Format `value` as a percentage of `total`, or in absolute units when
    /// the total is zero.
    pub fn format_share(&self, value: f64, total: f64) -> String {
        if total > 0.0 {
            format!("{:.2}%", value * 100.0 / total)
        } else {
            self.format_value(value)
        }
    }
}

/// A serializable copy of part of a model, for export and for consumers
/// that live across a process or language boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub unit: ValueUnit,
    pub root: NodeSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub label: SharedStr,
    pub cumulative: f64,
    pub local: f64,
    /// Value this node contributes to its parent in the snapshot.
    pub value: f64,
    pub children: Vec<NodeSnapshot>,
    /// Children were cut off by the depth limit or by a cycle.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Copy `model` from its root down to `max_depth` levels.
///
/// Children are ordered heaviest first. Each node is expanded at most once,
/// at its first (heaviest) occurrence; later occurrences, including those
/// closing a cycle, are emitted as truncated leaves. Shared subtrees thus
/// cost one copy instead of one per path.
pub fn snapshot<M: TreeModel>(model: &M, max_depth: usize) -> TreeSnapshot {
    let root = model.root();
    let mut expanded = HashSet::new();
    let value = model.cumulative(root);
    TreeSnapshot {
        unit: model.unit(),
        root: snapshot_node(model, root, value, max_depth, &mut expanded),
    }
}

fn snapshot_node<M: TreeModel>(
    model: &M,
    node: M::NodeId,
    value: f64,
    depth_left: usize,
    expanded: &mut HashSet<M::NodeId>,
) -> NodeSnapshot {
    let mut snap = NodeSnapshot {
        label: SharedStr::from(model.label(node)),
        cumulative: model.cumulative(node),
        local: model.local(node),
        value,
        children: Vec::new(),
        truncated: false,
    };

    let children = model.children(node);
    if children.is_empty() {
        return snap;
    }
    if depth_left == 0 || !expanded.insert(node) {
        snap.truncated = true;
        return snap;
    }

    let mut weighted: Vec<(M::NodeId, f64)> = children
        .into_iter()
        .map(|child| (child, model.child_value(node, child)))
        .collect();
    weighted.sort_by(|a, b| b.1.total_cmp(&a.1));

    snap.children = weighted
        .into_iter()
        .map(|(child, value)| snapshot_node(model, child, value, depth_left - 1, expanded))
        .collect();
    snap
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 0 -> 1 -> 2 -> 1 (cycle), 0 -> 3
    struct Cyclic;

    impl TreeModel for Cyclic {
        type NodeId = u32;

        fn root(&self) -> u32 {
            0
        }

        fn children(&self, node: u32) -> Vec<u32> {
            match node {
                0 => vec![3, 1],
                1 => vec![2],
                2 => vec![1],
                _ => Vec::new(),
            }
        }

        fn parents(&self, node: u32) -> Vec<u32> {
            match node {
                1 => vec![0, 2],
                2 => vec![1],
                3 => vec![0],
                _ => Vec::new(),
            }
        }

        fn cumulative(&self, node: u32) -> f64 {
            [10.0, 8.0, 5.0, 2.0][node as usize]
        }

        fn local(&self, node: u32) -> f64 {
            [0.0, 3.0, 5.0, 2.0][node as usize]
        }

        fn label(&self, node: u32) -> String {
            format!("n{node}")
        }

        fn unit(&self) -> ValueUnit {
            ValueUnit::Seconds
        }
    }

    #[test]
    fn snapshot_orders_heaviest_first_and_stops_cycles() {
        let snap = snapshot(&Cyclic, 16);
        assert_eq!(snap.root.label, "n0");
        assert_eq!(snap.root.children.len(), 2);
        assert_eq!(snap.root.children[0].label, "n1");
        assert_eq!(snap.root.children[1].label, "n3");

        let n1 = &snap.root.children[0];
        let n2 = &n1.children[0];
        let n1_again = &n2.children[0];
        assert_eq!(n1_again.label, "n1");
        assert!(n1_again.truncated);
        assert!(n1_again.children.is_empty());
    }

    #[test]
    fn snapshot_respects_depth() {
        let snap = snapshot(&Cyclic, 1);
        assert_eq!(snap.root.children.len(), 2);
        assert!(snap.root.children[0].truncated);
        assert!(!snap.root.children[1].truncated);
    }

    /// Layers of two nodes, each pointing at both nodes of the next layer.
    struct Lattice {
        layers: u32,
    }

    impl TreeModel for Lattice {
        type NodeId = u32;

        fn root(&self) -> u32 {
            0
        }

        fn children(&self, node: u32) -> Vec<u32> {
            let next = if node == 0 { 1 } else { node.div_ceil(2) * 2 + 1 };
            if next > self.layers * 2 {
                Vec::new()
            } else {
                vec![next, next + 1]
            }
        }

        fn parents(&self, _node: u32) -> Vec<u32> {
            Vec::new()
        }

        fn cumulative(&self, node: u32) -> f64 {
            f64::from(1000 - node)
        }

        fn local(&self, _node: u32) -> f64 {
            1.0
        }

        fn label(&self, node: u32) -> String {
            format!("n{node}")
        }

        fn unit(&self) -> ValueUnit {
            ValueUnit::Bytes
        }
    }

    fn count(node: &NodeSnapshot) -> usize {
        1 + node.children.iter().map(count).sum::<usize>()
    }

    #[test]
    fn shared_subtrees_are_expanded_once() {
        // A path-only guard would emit 2^20 leaves here.
        let snap = snapshot(&Lattice { layers: 20 }, 64);
        assert_eq!(count(&snap.root), 1 + 2 * 39);

        let first = &snap.root.children[0];
        assert_eq!(first.label, "n1");
        assert_eq!(first.children[0].label, "n3");
        assert!(!first.children[0].truncated);

        let second = &snap.root.children[1];
        assert_eq!(second.label, "n2");
        assert_eq!(second.children.len(), 2);
        assert!(second.children.iter().all(|c| c.truncated && c.children.is_empty()));
    }

    #[test]
    fn format_bytes_and_seconds() {
        assert_eq!(ValueUnit::Bytes.format_value(512.0), "512 B");
        assert_eq!(ValueUnit::Bytes.format_value(2048.0), "2.0 KiB");
        assert_eq!(ValueUnit::Seconds.format_value(1.23456), "1.235s");
        assert_eq!(ValueUnit::Seconds.format_share(1.0, 4.0), "25.00%");
        assert_eq!(ValueUnit::Weight.format_share(3.0, 0.0), "3");
    }

    #[test]
    fn speedscope_units() {
        assert_eq!(ValueUnit::from_speedscope("seconds"), ValueUnit::Seconds);
        assert_eq!(ValueUnit::from_speedscope("none"), ValueUnit::Weight);
    }
}
