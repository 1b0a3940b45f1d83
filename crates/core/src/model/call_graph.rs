use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use runsnake_protocol::{SharedStr, TreeModel, ValueUnit};
use serde::Serialize;
use thiserror::Error;

/// Identifier of a source file, as assigned by the profiler (event logs) or
/// by interning file names (statistics tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileId(pub u32);

/// Index of a function in its [`FunctionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FunctionId(pub usize);

/// Counters for a function or for one caller → callee relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CallStats {
    /// All calls, recursive ones included.
    pub calls: u64,
    /// Calls made while the function was already on the stack.
    pub recursive: u64,
    /// Seconds spent in the function body itself.
    pub local: f64,
    /// Seconds spent in the function and everything it called.
    pub cumulative: f64,
}

impl CallStats {
    pub fn add(&mut self, other: &CallStats) {
        self.calls += other.calls;
        self.recursive += other.recursive;
        self.local += other.local;
        self.cumulative += other.cumulative;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub filename: SharedStr,
    /// Functions defined in this file, by first line. Functions without a
    /// definition line (builtins at line 0) are not listed.
    pub functions: BTreeMap<u32, FunctionId>,
}

impl FileRecord {
    pub fn directory(&self) -> String {
        Path::new(self.filename.as_str())
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn basename(&self) -> String {
        Path::new(self.filename.as_str())
            .file_name()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filename.to_string())
    }
}

/// A resolved caller of a function together with the statistics of that
/// particular calling relationship.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallEdge {
    pub caller: FunctionId,
    pub stats: CallStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionRecord {
    pub id: FunctionId,
    pub name: SharedStr,
    /// Non-owning back reference into the [`FileTable`].
    pub file: FileId,
    pub line: u32,
    pub calls: u64,
    pub recursive: u64,
    pub local: f64,
    pub cumulative: f64,
    pub callers: Vec<CallEdge>,
    /// Filled in by weaving.
    pub parents: Vec<FunctionId>,
    /// Filled in by weaving.
    pub children: Vec<FunctionId>,
}

impl FunctionRecord {
    pub fn new(id: FunctionId, name: SharedStr, file: FileId, line: u32) -> Self {
        Self {
            id,
            name,
            file,
            line,
            calls: 0,
            recursive: 0,
            local: 0.0,
            cumulative: 0.0,
            callers: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn local_per_call(&self) -> f64 {
        per_call(self.local, self.calls)
    }

    pub fn cumulative_per_call(&self) -> f64 {
        per_call(self.cumulative, self.calls)
    }

    pub fn stats(&self) -> CallStats {
        CallStats {
            calls: self.calls,
            recursive: self.recursive,
            local: self.local,
            cumulative: self.cumulative,
        }
    }

    /// Statistics of the call relationship from `caller`, if there is one.
    pub fn edge_from(&self, caller: FunctionId) -> Option<&CallStats> {
        self.callers
            .iter()
            .find(|edge| edge.caller == caller)
            .map(|edge| &edge.stats)
    }
}

fn per_call(total: f64, calls: u64) -> f64 {
    if calls == 0 { 0.0 } else { total / calls as f64 }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileTable {
    files: BTreeMap<FileId, FileRecord>,
    #[serde(skip)]
    by_name: HashMap<SharedStr, FileId>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file under an externally assigned id, replacing any
    /// earlier definition of that id.
    pub fn define(&mut self, id: FileId, filename: SharedStr) -> &mut FileRecord {
        if let Some(old) = self.files.get(&id).map(|r| r.filename.clone())
            && old != filename
            && self.by_name.get(&old) == Some(&id)
        {
            self.by_name.remove(&old);
        }
        self.by_name.insert(filename.clone(), id);
        let record = self.files.entry(id).or_insert_with(|| FileRecord {
            id,
            filename: filename.clone(),
            functions: BTreeMap::new(),
        });
        record.filename = filename;
        record
    }

    /// Id of `filename`, assigning the next free id on first sight.
    pub fn intern_path(&mut self, filename: &str) -> FileId {
        if let Some(&id) = self.by_name.get(filename) {
            return id;
        }
        let next = self.files.keys().next_back().map_or(0, |id| id.0 + 1);
        self.define(FileId(next), SharedStr::from(filename)).id
    }

    pub fn get(&self, id: FileId) -> Option<&FileRecord> {
        self.files.get(&id)
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut FileRecord> {
        self.files.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionTable {
    records: Vec<FunctionRecord>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: SharedStr, file: FileId, line: u32) -> FunctionId {
        let id = FunctionId(self.records.len());
        self.records.push(FunctionRecord::new(id, name, file, line));
        id
    }

    pub fn get(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.records.get(id.0)
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut FunctionRecord> {
        self.records.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::ops::Index<FunctionId> for FunctionTable {
    type Output = FunctionRecord;

    fn index(&self, id: FunctionId) -> &FunctionRecord {
        &self.records[id.0]
    }
}

/// Fill in `parents` and `children` from the resolved caller edges.
fn link(functions: &mut FunctionTable) {
    for record in &mut functions.records {
        record.parents.clear();
        record.children.clear();
    }

    let links: Vec<(FunctionId, FunctionId)> = functions
        .iter()
        .flat_map(|record| record.callers.iter().map(move |edge| (edge.caller, record.id)))
        .filter(|(caller, _)| caller.0 < functions.len())
        .collect();
    for (parent, child) in links {
        functions.records[child.0].parents.push(parent);
        functions.records[parent.0].children.push(child);
    }
}

/// Functions with no caller but themselves, with their whole statistics.
fn caller_free(functions: &FunctionTable) -> BTreeMap<FunctionId, CallStats> {
    functions
        .iter()
        .filter(|record| record.parents.iter().all(|&p| p == record.id))
        .map(|record| (record.id, record.stats()))
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallGraphError {
    #[error("profile contains no functions")]
    Empty,
    #[error("no top-level function: every function has a caller")]
    NoRoot,
}

/// A node of the call hierarchy: a function, or the synthetic group that
/// holds several top-level functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallNode {
    Root,
    Function(FunctionId),
}

/// Caller/callee graph with aggregated timings.
#[derive(Debug, Clone, Serialize)]
pub struct CallGraph {
    files: FileTable,
    functions: FunctionTable,
    roots: Vec<FunctionId>,
    /// Statistics of the calls made from the top of the stack, per root.
    top_level: BTreeMap<FunctionId, CallStats>,
    root: CallNode,
    root_stats: CallStats,
    unattributed: f64,
}

impl CallGraph {
    /// Link every function to its resolved callers and pick the root.
    ///
    /// Functions without callers other than themselves are the roots, each
    /// accounting for its whole cumulative time. A single root becomes the
    /// graph root directly; several are grouped under a synthetic
    /// [`CallNode::Root`] whose totals are their sums.
    pub fn weave(
        files: FileTable,
        mut functions: FunctionTable,
        unattributed: f64,
    ) -> Result<Self, CallGraphError> {
        if functions.is_empty() {
            return Err(CallGraphError::Empty);
        }
        link(&mut functions);
        let top_level = caller_free(&functions);
        Self::assemble(files, functions, top_level, unattributed)
    }

    /// Like [`weave`](Self::weave), but with the top-level calls already
    /// known, each with the statistics of the calls made from the top of the
    /// stack.
    ///
    /// A top-level function may also have callers (recursion back through
    /// the entry point, or a function run both at top level and from
    /// elsewhere); only its top-level share counts toward the root. When no
    /// call was made at top level the roots fall back to caller-free
    /// functions.
    pub fn weave_with_roots(
        files: FileTable,
        mut functions: FunctionTable,
        top_level: BTreeMap<FunctionId, CallStats>,
        unattributed: f64,
    ) -> Result<Self, CallGraphError> {
        if functions.is_empty() {
            return Err(CallGraphError::Empty);
        }
        link(&mut functions);
        let mut top_level: BTreeMap<FunctionId, CallStats> = top_level
            .into_iter()
            .filter(|(id, _)| id.0 < functions.len())
            .collect();
        if top_level.is_empty() {
            top_level = caller_free(&functions);
        }
        Self::assemble(files, functions, top_level, unattributed)
    }

    fn assemble(
        files: FileTable,
        functions: FunctionTable,
        top_level: BTreeMap<FunctionId, CallStats>,
        unattributed: f64,
    ) -> Result<Self, CallGraphError> {
        let roots: Vec<FunctionId> = top_level.keys().copied().collect();
        let mut root_stats = CallStats::default();
        for stats in top_level.values() {
            root_stats.calls += stats.calls;
            root_stats.recursive += stats.recursive;
            root_stats.cumulative += stats.cumulative;
        }

        let root = match roots.as_slice() {
            [] => return Err(CallGraphError::NoRoot),
            [only] => CallNode::Function(*only),
            _ => CallNode::Root,
        };
        log::debug!(
            "call graph: {} functions, {} files, {} roots",
            functions.len(),
            files.len(),
            roots.len()
        );

        Ok(Self {
            files,
            functions,
            roots,
            top_level,
            root,
            root_stats,
            unattributed,
        })
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn function(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.functions.get(id)
    }

    /// Top-level functions, in table order.
    pub fn roots(&self) -> &[FunctionId] {
        &self.roots
    }

    /// Statistics of `root`'s calls made from the top of the stack.
    pub fn top_level_stats(&self, root: FunctionId) -> Option<&CallStats> {
        self.top_level.get(&root)
    }

    /// Sums over the top-level calls. Local time is not summed: the root
    /// itself executes nothing.
    pub fn root_stats(&self) -> CallStats {
        self.root_stats
    }

    /// Seconds the profiler logged outside any known function.
    pub fn unattributed(&self) -> f64 {
        self.unattributed
    }

    pub fn file_of(&self, id: FunctionId) -> Option<&FileRecord> {
        self.function(id).and_then(|f| self.files.get(f.file))
    }

    /// Look up the function defined at `line` of `file`.
    pub fn function_at(&self, file: FileId, line: u32) -> Option<&FunctionRecord> {
        self.files
            .get(file)
            .and_then(|f| f.functions.get(&line))
            .and_then(|id| self.functions.get(*id))
            .or_else(|| {
                self.functions
                    .iter()
                    .find(|f| f.file == file && f.line == line)
            })
    }

    /// Fraction of `parent`'s cumulative time spent in calls to `child`.
    pub fn child_cumulative_time(&self, parent: CallNode, child: FunctionId) -> f64 {
        let total = self.cumulative(parent);
        if total <= 0.0 {
            return 0.0;
        }
        self.child_value(parent, CallNode::Function(child)) / total
    }
}

impl TreeModel for CallGraph {
    type NodeId = CallNode;

    fn root(&self) -> CallNode {
        self.root
    }

    fn children(&self, node: CallNode) -> Vec<CallNode> {
        match node {
            CallNode::Root => self.roots.iter().copied().map(CallNode::Function).collect(),
            CallNode::Function(id) => self
                .function(id)
                .map(|f| f.children.iter().copied().map(CallNode::Function).collect())
                .unwrap_or_default(),
        }
    }

    fn parents(&self, node: CallNode) -> Vec<CallNode> {
        match node {
            CallNode::Root => Vec::new(),
            CallNode::Function(id) => {
                let mut parents: Vec<CallNode> = self
                    .function(id)
                    .map(|f| f.parents.iter().copied().map(CallNode::Function).collect())
                    .unwrap_or_default();
                if self.root == CallNode::Root && self.roots.contains(&id) {
                    parents.push(CallNode::Root);
                }
                parents
            }
        }
    }

    fn cumulative(&self, node: CallNode) -> f64 {
        match node {
            CallNode::Root => self.root_stats.cumulative,
            CallNode::Function(id) => self.function(id).map_or(0.0, |f| f.cumulative),
        }
    }

    fn local(&self, node: CallNode) -> f64 {
        match node {
            CallNode::Root => 0.0,
            CallNode::Function(id) => self.function(id).map_or(0.0, |f| f.local),
        }
    }

    fn label(&self, node: CallNode) -> String {
        match node {
            CallNode::Root => "<profile>".to_string(),
            CallNode::Function(id) => match self.function(id) {
                Some(f) => {
                    let file = self
                        .files
                        .get(f.file)
                        .map(FileRecord::basename)
                        .unwrap_or_else(|| "?".to_string());
                    format!("{}@{}:{}", f.name, file, f.line)
                }
                None => format!("<function {}>", id.0),
            },
        }
    }

    fn unit(&self) -> ValueUnit {
        ValueUnit::Seconds
    }

    fn child_value(&self, parent: CallNode, child: CallNode) -> f64 {
        match (parent, child) {
            (CallNode::Function(p), CallNode::Function(c)) => self
                .function(c)
                .and_then(|f| f.edge_from(p))
                .map_or(0.0, |edge| edge.cumulative),
            (CallNode::Root, CallNode::Function(c)) => self
                .top_level_stats(c)
                .map_or_else(|| self.cumulative(child), |stats| stats.cumulative),
            _ => self.cumulative(child),
        }
    }
}
