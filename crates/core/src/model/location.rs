use std::collections::BTreeMap;
use std::path::Path;

use runsnake_protocol::{TreeModel, ValueUnit};

use super::call_graph::{CallGraph, FunctionId};

/// Functions with this name stand for module-level code; their time is
/// reported as the enclosing directory's own time.
pub const MODULE_FUNCTION: &str = "<module>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationNode {
    Group(usize),
    Function(FunctionId),
}

#[derive(Debug, Clone)]
pub struct LocationGroup {
    /// Directory path; empty for the top-level group.
    pub directory: String,
    pub parent: Option<usize>,
    pub groups: Vec<usize>,
    pub functions: Vec<FunctionId>,
    /// `<module>` pseudo-functions: counted in `local`, never expanded.
    pub local_functions: Vec<FunctionId>,
    pub calls: u64,
    pub recursive: u64,
    pub local: f64,
    pub cumulative: f64,
}

impl LocationGroup {
    fn new(directory: String) -> Self {
        Self {
            directory,
            parent: None,
            groups: Vec::new(),
            functions: Vec::new(),
            local_functions: Vec::new(),
            calls: 0,
            recursive: 0,
            local: 0.0,
            cumulative: 0.0,
        }
    }
}

/// Functions of a call graph arranged by the directory they live in
/// rather than by who calls them.
#[derive(Debug)]
pub struct LocationTree<'a> {
    graph: &'a CallGraph,
    groups: Vec<LocationGroup>,
    owner: BTreeMap<FunctionId, usize>,
}

impl<'a> LocationTree<'a> {
    pub fn build(graph: &'a CallGraph) -> Self {
        let mut groups = vec![LocationGroup::new(String::new())];
        let mut by_directory: BTreeMap<String, usize> = BTreeMap::new();
        by_directory.insert(String::new(), 0);
        let mut owner = BTreeMap::new();

        for function in graph.functions().iter() {
            let directory = graph
                .file_of(function.id)
                .map(|file| file.directory())
                .unwrap_or_default();
            let index = *by_directory.entry(directory.clone()).or_insert_with(|| {
                groups.push(LocationGroup::new(directory));
                groups.len() - 1
            });
            if function.name == MODULE_FUNCTION {
                groups[index].local_functions.push(function.id);
            } else {
                groups[index].functions.push(function.id);
            }
            owner.insert(function.id, index);
        }

        // Hang each directory under its closest registered ancestor.
        for (directory, &index) in &by_directory {
            if index == 0 {
                continue;
            }
            let parent = Path::new(directory)
                .ancestors()
                .skip(1)
                .filter(|p| !p.as_os_str().is_empty())
                .find_map(|p| by_directory.get(&*p.to_string_lossy()).copied())
                .filter(|&p| p != index)
                .unwrap_or(0);
            groups[index].parent = Some(parent);
            groups[parent].groups.push(index);
        }

        let mut tree = Self {
            graph,
            groups,
            owner,
        };
        tree.finalize();
        tree
    }

    /// Sum totals bottom-up. A parent directory is always a strict prefix
    /// of its children, so sorting by path depth gives a post-order.
    fn finalize(&mut self) {
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.sort_by_key(|&i| {
            let depth = if i == 0 {
                0
            } else {
                Path::new(&self.groups[i].directory).components().count() + 1
            };
            std::cmp::Reverse(depth)
        });

        for index in order {
            let graph = self.graph;
            let group = &self.groups[index];

            let local: f64 = group
                .local_functions
                .iter()
                .filter_map(|&id| graph.function(id))
                .map(|f| f.local)
                .sum();
            let mut calls = 0;
            let mut recursive = 0;
            let mut cumulative = local;
            for f in group.functions.iter().filter_map(|&id| graph.function(id)) {
                calls += f.calls;
                recursive += f.recursive;
                cumulative += f.cumulative;
            }
            for &child in &group.groups {
                let child = &self.groups[child];
                calls += child.calls;
                recursive += child.recursive;
                cumulative += child.cumulative;
            }

            let group = &mut self.groups[index];
            group.local = local;
            group.calls = calls;
            group.recursive = recursive;
            group.cumulative = cumulative;
        }
    }

    pub fn group(&self, index: usize) -> Option<&LocationGroup> {
        self.groups.get(index)
    }

    pub fn groups(&self) -> &[LocationGroup] {
        &self.groups
    }

    /// The group whose directory holds `function`.
    pub fn group_of(&self, function: FunctionId) -> Option<usize> {
        self.owner.get(&function).copied()
    }

    pub fn local_children(&self, index: usize) -> Vec<LocationNode> {
        self.groups
            .get(index)
            .map(|g| {
                g.local_functions
                    .iter()
                    .copied()
                    .map(LocationNode::Function)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TreeModel for LocationTree<'_> {
    type NodeId = LocationNode;

    fn root(&self) -> LocationNode {
        LocationNode::Group(0)
    }

    fn children(&self, node: LocationNode) -> Vec<LocationNode> {
        match node {
            LocationNode::Group(index) => self
                .groups
                .get(index)
                .map(|g| {
                    g.groups
                        .iter()
                        .copied()
                        .map(LocationNode::Group)
                        .chain(g.functions.iter().copied().map(LocationNode::Function))
                        .collect()
                })
                .unwrap_or_default(),
            LocationNode::Function(_) => Vec::new(),
        }
    }

    fn parents(&self, node: LocationNode) -> Vec<LocationNode> {
        let parent = match node {
            LocationNode::Group(index) => self.groups.get(index).and_then(|g| g.parent),
            LocationNode::Function(id) => self.group_of(id),
        };
        parent.map(LocationNode::Group).into_iter().collect()
    }

    fn cumulative(&self, node: LocationNode) -> f64 {
        match node {
            LocationNode::Group(index) => self.groups.get(index).map_or(0.0, |g| g.cumulative),
            LocationNode::Function(id) => self.graph.function(id).map_or(0.0, |f| f.cumulative),
        }
    }

    fn local(&self, node: LocationNode) -> f64 {
        match node {
            LocationNode::Group(index) => self.groups.get(index).map_or(0.0, |g| g.local),
            LocationNode::Function(id) => self.graph.function(id).map_or(0.0, |f| f.local),
        }
    }

    fn label(&self, node: LocationNode) -> String {
        match node {
            LocationNode::Group(0) => "PYTHONPATH".to_string(),
            LocationNode::Group(index) => self
                .groups
                .get(index)
                .map(|g| g.directory.clone())
                .unwrap_or_default(),
            LocationNode::Function(id) => self
                .graph
                .function(id)
                .map(|f| format!("{}:{}", f.name, f.line))
                .unwrap_or_default(),
        }
    }

    fn unit(&self) -> ValueUnit {
        ValueUnit::Seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::call_graph::{CallEdge, CallStats, FileTable, FunctionTable};

    fn graph() -> CallGraph {
        let mut files = FileTable::new();
        let top = files.intern_path("/proj/run.py");
        let pkg = files.intern_path("/proj/pkg/core.py");
        let deep = files.intern_path("/proj/pkg/sub/leaf.py");

        let mut functions = FunctionTable::new();
        let module = functions.push(MODULE_FUNCTION.into(), top, 1);
        let run = functions.push("run".into(), top, 3);
        let core = functions.push("core".into(), pkg, 7);
        let leaf = functions.push("leaf".into(), deep, 2);

        for (id, local, cumulative) in [
            (module, 0.5, 10.0),
            (run, 1.0, 9.5),
            (core, 3.0, 8.5),
            (leaf, 5.5, 5.5),
        ] {
            if let Some(f) = functions.get_mut(id) {
                f.calls = 1;
                f.local = local;
                f.cumulative = cumulative;
            }
        }
        for (child, caller) in [(run, module), (core, run), (leaf, core)] {
            if let Some(f) = functions.get_mut(child) {
                f.callers.push(CallEdge {
                    caller,
                    stats: CallStats::default(),
                });
            }
        }
        CallGraph::weave(files, functions, 0.0).unwrap()
    }

    #[test]
    fn directories_nest_under_closest_ancestor() {
        let graph = graph();
        let tree = LocationTree::build(&graph);

        let dirs: Vec<&str> = tree.groups().iter().map(|g| g.directory.as_str()).collect();
        assert_eq!(dirs, vec!["", "/proj", "/proj/pkg", "/proj/pkg/sub"]);
        assert_eq!(tree.group(1).unwrap().parent, Some(0));
        assert_eq!(tree.group(2).unwrap().parent, Some(1));
        assert_eq!(tree.group(3).unwrap().parent, Some(2));
    }

    #[test]
    fn module_functions_count_as_local_time_only() {
        let graph = graph();
        let tree = LocationTree::build(&graph);

        let proj = tree.group(1).unwrap();
        assert_eq!(proj.local_functions, vec![FunctionId(0)]);
        assert_eq!(proj.functions, vec![FunctionId(1)]);
        assert_eq!(proj.local, 0.5);
        // run (9.5) + pkg subtree (8.5 + 5.5) + own local (0.5)
        assert!((proj.cumulative - 24.0).abs() < 1e-9);
        assert!(
            !tree
                .children(LocationNode::Group(1))
                .contains(&LocationNode::Function(FunctionId(0)))
        );
        assert_eq!(tree.local_children(1), vec![LocationNode::Function(FunctionId(0))]);
    }

    #[test]
    fn group_totals_are_sums_of_children() {
        let graph = graph();
        let tree = LocationTree::build(&graph);
        for (index, group) in tree.groups().iter().enumerate() {
            let children: f64 = tree
                .children(LocationNode::Group(index))
                .into_iter()
                .map(|c| tree.cumulative(c))
                .sum();
            assert!((children + group.local - group.cumulative).abs() < 1e-9);
        }
        assert_eq!(
            tree.parents(LocationNode::Function(FunctionId(3))),
            vec![LocationNode::Group(3)]
        );
    }
}
