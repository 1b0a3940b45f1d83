use std::collections::HashMap;
use std::sync::Arc;

use runsnake_protocol::{SharedStr, TreeModel, ValueUnit};
use serde::Serialize;
use thiserror::Error;

/// One entry of the shared frame table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub index: usize,
    pub name: SharedStr,
    pub file: Option<SharedStr>,
    pub line: Option<i64>,
    pub col: Option<i64>,
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(file) = &self.file {
            write!(f, "@{file}")?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StackNodeId(pub usize);

/// A unique call path observed in the samples.
#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    /// Frame indices from the outermost call to this one; empty for the
    /// synthetic root.
    pub path: Box<[usize]>,
    pub cumulative: f64,
    pub local: f64,
    pub calls: u64,
    pub children: Vec<StackNodeId>,
}

impl StackFrame {
    fn new(path: &[usize]) -> Self {
        Self {
            path: path.into(),
            cumulative: 0.0,
            local: 0.0,
            calls: 0,
            children: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Index of this node's own frame; `None` for the synthetic root.
    pub fn frame(&self) -> Option<usize> {
        self.path.last().copied()
    }

    pub fn local_per_call(&self) -> f64 {
        if self.calls == 0 { 0.0 } else { self.local / self.calls as f64 }
    }

    pub fn cumulative_per_call(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.cumulative / self.calls as f64
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackError {
    #[error("frame index {index} out of range (table has {frames} frames)")]
    FrameIndex { index: usize, frames: usize },
}

/// Path-keyed trie of stack samples.
///
/// Node 0 is the synthetic root at the empty path; its children are the
/// natural roots in order of first appearance. Every weight is credited to
/// each prefix of its stack as cumulative and to the full stack as local.
#[derive(Debug, Clone)]
pub struct StackTree {
    name: SharedStr,
    unit: ValueUnit,
    frames: Arc<[Frame]>,
    nodes: Vec<StackFrame>,
    by_path: HashMap<Vec<usize>, StackNodeId>,
    skipped: usize,
}

pub const ROOT: StackNodeId = StackNodeId(0);

impl StackTree {
    pub fn new(name: SharedStr, unit: ValueUnit, frames: Arc<[Frame]>) -> Self {
        let mut by_path = HashMap::new();
        by_path.insert(Vec::new(), ROOT);
        Self {
            name,
            unit,
            frames,
            nodes: vec![StackFrame::new(&[])],
            by_path,
            skipped: 0,
        }
    }

    /// Fold one sample (outermost frame first) into the trie.
    ///
    /// Empty samples carry no stack and are only counted.
    pub fn add_sample(&mut self, sample: &[usize], weight: f64) -> Result<(), StackError> {
        if sample.is_empty() {
            self.skipped += 1;
            return Ok(());
        }
        self.check_frames(sample)?;

        let root = &mut self.nodes[ROOT.0];
        root.cumulative += weight;
        root.calls += 1;

        let last = sample.len() - 1;
        for depth in 0..sample.len() {
            let id = self.node_for(&sample[..=depth]);
            let node = &mut self.nodes[id.0];
            node.cumulative += weight;
            node.calls += 1;
            if depth == last {
                node.local += weight;
            }
        }
        Ok(())
    }

    /// Credit `weight` spent with `stack` active, without counting a call.
    pub fn add_interval(&mut self, stack: &[usize], weight: f64) -> Result<(), StackError> {
        if stack.is_empty() {
            return Ok(());
        }
        self.check_frames(stack)?;

        self.nodes[ROOT.0].cumulative += weight;
        let last = stack.len() - 1;
        for depth in 0..stack.len() {
            let id = self.node_for(&stack[..=depth]);
            let node = &mut self.nodes[id.0];
            node.cumulative += weight;
            if depth == last {
                node.local += weight;
            }
        }
        Ok(())
    }

    /// Count one call of the innermost frame of `stack`.
    pub fn record_call(&mut self, stack: &[usize]) -> Result<(), StackError> {
        if stack.is_empty() {
            return Ok(());
        }
        self.check_frames(stack)?;
        if stack.len() == 1 {
            self.nodes[ROOT.0].calls += 1;
        }
        let id = self.node_for(stack);
        self.nodes[id.0].calls += 1;
        Ok(())
    }

    fn check_frames(&self, stack: &[usize]) -> Result<(), StackError> {
        match stack.iter().find(|&&index| index >= self.frames.len()) {
            Some(&index) => Err(StackError::FrameIndex {
                index,
                frames: self.frames.len(),
            }),
            None => Ok(()),
        }
    }

    /// Look up or create the node for `path`; its prefix must exist.
    fn node_for(&mut self, path: &[usize]) -> StackNodeId {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = StackNodeId(self.nodes.len());
        self.nodes.push(StackFrame::new(path));
        let parent = self
            .by_path
            .get(&path[..path.len() - 1])
            .copied()
            .unwrap_or(ROOT);
        self.nodes[parent.0].children.push(id);
        self.by_path.insert(path.to_vec(), id);
        if path.len() == 1 {
            log::debug!("found new root: {path:?}");
        }
        id
    }

    pub fn name(&self) -> &SharedStr {
        &self.name
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn node(&self, id: StackNodeId) -> Option<&StackFrame> {
        self.nodes.get(id.0)
    }

    pub fn get(&self, path: &[usize]) -> Option<StackNodeId> {
        self.by_path.get(path).copied()
    }

    /// The node one call level up, found by truncating the path.
    pub fn parent(&self, id: StackNodeId) -> Option<StackNodeId> {
        let path = &self.node(id)?.path;
        if path.is_empty() {
            return None;
        }
        self.get(&path[..path.len() - 1])
    }

    /// Natural roots: the length-one paths.
    pub fn roots(&self) -> &[StackNodeId] {
        &self.nodes[ROOT.0].children
    }

    /// Weight of all non-empty samples.
    pub fn total(&self) -> f64 {
        self.nodes[ROOT.0].cumulative
    }

    pub fn skipped_samples(&self) -> usize {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn iter(&self) -> impl Iterator<Item = (StackNodeId, &StackFrame)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (StackNodeId(i), node))
    }
}

/// Every profile of one speedscope document.
#[derive(Debug, Clone)]
pub struct StackProfiles {
    pub name: Option<SharedStr>,
    pub profiles: Vec<StackTree>,
    /// Profile shown first.
    pub active: usize,
}

impl StackProfiles {
    pub fn active(&self) -> Option<&StackTree> {
        self.profiles.get(self.active).or_else(|| self.profiles.first())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl TreeModel for StackTree {
    type NodeId = StackNodeId;

    fn root(&self) -> StackNodeId {
        ROOT
    }

    fn children(&self, node: StackNodeId) -> Vec<StackNodeId> {
        self.node(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn parents(&self, node: StackNodeId) -> Vec<StackNodeId> {
        self.parent(node).into_iter().collect()
    }

    fn cumulative(&self, node: StackNodeId) -> f64 {
        self.node(node).map_or(0.0, |n| n.cumulative)
    }

    fn local(&self, node: StackNodeId) -> f64 {
        self.node(node).map_or(0.0, |n| n.local)
    }

    fn label(&self, node: StackNodeId) -> String {
        match self.node(node).and_then(StackFrame::frame) {
            Some(index) => self
                .frames
                .get(index)
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("frame-{index}")),
            None => self.name.to_string(),
        }
    }

    fn unit(&self) -> ValueUnit {
        self.unit
    }
}
