use runsnake_protocol::{SourceFormat, TreeSnapshot, snapshot};
use serde::{Deserialize, Serialize};

use super::call_graph::CallGraph;
use super::location::LocationTree;
use super::memory::MemoryTree;
use super::stack_tree::StackProfiles;

/// A loaded input, in the hierarchy its loader produces.
#[derive(Debug, Clone)]
pub enum Dataset {
    Calls(CallGraph),
    Memory(MemoryTree),
    Samples(StackProfiles),
}

/// A way of looking at a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    /// Callers above callees.
    Functions,
    /// Functions grouped by the directory they live in.
    Location,
    /// Has-a cost hierarchy of a memory dump.
    Memory,
    /// Call paths of the active sampled profile.
    Samples,
}

impl std::fmt::Display for ViewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Functions => write!(f, "functions"),
            Self::Location => write!(f, "location"),
            Self::Memory => write!(f, "memory"),
            Self::Samples => write!(f, "samples"),
        }
    }
}

impl Dataset {
    /// Views this dataset can be shown in; the first is the default.
    pub fn views(&self) -> &'static [ViewKind] {
        match self {
            Self::Calls(_) => &[ViewKind::Functions, ViewKind::Location],
            Self::Memory(_) => &[ViewKind::Memory],
            Self::Samples(_) => &[ViewKind::Samples],
        }
    }

    pub fn default_view(&self) -> ViewKind {
        self.views()[0]
    }

    /// Serializable copy of `view` down to `max_depth` levels, or `None`
    /// when the dataset has no such view.
    pub fn snapshot(&self, view: ViewKind, max_depth: usize) -> Option<TreeSnapshot> {
        match (self, view) {
            (Self::Calls(graph), ViewKind::Functions) => Some(snapshot(graph, max_depth)),
            (Self::Calls(graph), ViewKind::Location) => {
                Some(snapshot(&LocationTree::build(graph), max_depth))
            }
            (Self::Memory(tree), ViewKind::Memory) => Some(snapshot(tree, max_depth)),
            (Self::Samples(profiles), ViewKind::Samples) => {
                profiles.active().map(|tree| snapshot(tree, max_depth))
            }
            _ => None,
        }
    }
}

/// A dataset within a session, with where it came from.
#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub dataset: Dataset,
    pub format: SourceFormat,
    /// Human-readable label for this input, usually its file name.
    pub label: String,
}

/// Ordered collection of loaded datasets.
///
/// Loads are independent of each other; the session only remembers them in
/// the order they were opened.
#[derive(Debug, Clone, Default)]
pub struct Session {
    entries: Vec<DatasetEntry>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session from a single dataset (most common case).
    pub fn from_dataset(dataset: Dataset, format: SourceFormat, label: impl Into<String>) -> Self {
        let mut session = Self::new();
        session.add(dataset, format, label);
        session
    }

    pub fn add(&mut self, dataset: Dataset, format: SourceFormat, label: impl Into<String>) {
        self.entries.push(DatasetEntry {
            dataset,
            format,
            label: label.into(),
        });
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&DatasetEntry> {
        self.entries.get(index)
    }

    /// The most recently opened dataset with this label.
    pub fn find(&self, label: &str) -> Option<&DatasetEntry> {
        self.entries.iter().rev().find(|e| e.label == label)
    }

    pub fn remove(&mut self, index: usize) -> Option<DatasetEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
