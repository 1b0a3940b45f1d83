use std::collections::{BTreeMap, HashMap};

use runsnake_protocol::{SharedStr, TreeModel, ValueUnit};
use serde::{Deserialize, Serialize};

/// Identity of a memory record.
///
/// Dump addresses are kept apart from the ids of nodes the reducer creates
/// (loops, groups), so a synthetic node can never collide with an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Address {
    Object(u64),
    Synthetic(u64),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(addr) => write!(f, "{addr}"),
            Self::Synthetic(id) => write!(f, "#{id}"),
        }
    }
}

/// Mints synthetic addresses for one load.
#[derive(Debug, Default)]
pub struct AddressAllocator {
    next: u64,
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self) -> Address {
        let address = Address::Synthetic(self.next);
        self.next += 1;
        address
    }

    /// How many addresses have been handed out.
    pub fn minted(&self) -> u64 {
        self.next
    }
}

/// One line of a meliae dump. Fields the loader does not use are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawRecord {
    pub address: u64,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub name: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub refs: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecordKind {
    Object,
    /// Strongly connected records collapsed into one node.
    Loop { members: Vec<Address> },
    /// Same-type leaves of one parent folded together.
    Group { count: usize },
}

/// A record after every reduction pass, with its cost attribution.
#[derive(Debug, Clone, Serialize)]
pub struct ReducedRecord {
    pub address: Address,
    pub type_name: SharedStr,
    pub name: Option<SharedStr>,
    pub kind: RecordKind,
    /// Own bytes, including anything absorbed or inlined into the record.
    pub size: u64,
    /// Records this one pays for, in reference order.
    pub children: Vec<Address>,
    /// Distinct records paying a share of this one.
    pub parents: Vec<Address>,
    /// Shares of the children's cost.
    pub rsize: f64,
    pub totsize: f64,
}

impl ReducedRecord {
    /// The part of this record's cost carried by each of its parents.
    pub fn share(&self) -> f64 {
        self.totsize / self.parents.len().max(1) as f64
    }

    pub fn label(&self) -> String {
        match (&self.kind, &self.name) {
            (RecordKind::Group { count }, _) => format!("{count} × {}", self.type_name),
            (RecordKind::Loop { members }, _) => {
                format!("{} ({} members)", self.type_name, members.len())
            }
            (RecordKind::Object, Some(name)) => format!("{} {name}", self.type_name),
            (RecordKind::Object, None) => format!("{} @{}", self.type_name, self.address),
        }
    }
}

/// Original records folded into loops, kept for drill-down.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopTable {
    pub members: BTreeMap<Address, ReducedRecord>,
    #[serde(skip)]
    pub member_of: HashMap<Address, Address>,
}

/// Instance count and bytes of one type over the raw dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    pub type_name: SharedStr,
    pub count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryNode {
    Root,
    /// Records no module reaches.
    Unreachable,
    Record(Address),
}

/// Has-a cost hierarchy of a memory dump.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryTree {
    name: SharedStr,
    records: BTreeMap<Address, ReducedRecord>,
    /// Module roots, largest first.
    modules: Vec<Address>,
    /// Unreferenced records that are not modules, largest first.
    garbage: Vec<Address>,
    loops: LoopTable,
    types: Vec<TypeSummary>,
    raw_total: u64,
    duplicates: usize,
    duplicate_bytes: u64,
}

impl MemoryTree {
    pub(crate) fn new(
        name: SharedStr,
        records: BTreeMap<Address, ReducedRecord>,
        mut modules: Vec<Address>,
        mut garbage: Vec<Address>,
        loops: LoopTable,
        types: Vec<TypeSummary>,
        raw_total: u64,
    ) -> Self {
        let totsize = |a: &Address| records.get(a).map_or(0.0, |r| r.totsize);
        modules.sort_by(|a, b| totsize(b).total_cmp(&totsize(a)).then(a.cmp(b)));
        garbage.sort_by(|a, b| totsize(b).total_cmp(&totsize(a)).then(a.cmp(b)));
        Self {
            name,
            records,
            modules,
            garbage,
            loops,
            types,
            raw_total,
            duplicates: 0,
            duplicate_bytes: 0,
        }
    }

    /// Record the duplicate-address records dropped while indexing.
    pub(crate) fn with_duplicates(mut self, records: usize, bytes: u64) -> Self {
        self.duplicates = records;
        self.duplicate_bytes = bytes;
        self
    }

    pub fn name(&self) -> &SharedStr {
        &self.name
    }

    pub fn record(&self, address: Address) -> Option<&ReducedRecord> {
        self.records.get(&address)
    }

    pub fn records(&self) -> impl Iterator<Item = &ReducedRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn modules(&self) -> &[Address] {
        &self.modules
    }

    pub fn garbage(&self) -> &[Address] {
        &self.garbage
    }

    /// The original records collapsed into `loop_address`.
    pub fn loop_members(&self, loop_address: Address) -> Vec<&ReducedRecord> {
        match self.records.get(&loop_address).map(|r| &r.kind) {
            Some(RecordKind::Loop { members }) => members
                .iter()
                .filter_map(|m| self.loops.members.get(m))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// A record folded into a loop, looked up by its own address.
    pub fn member(&self, address: Address) -> Option<&ReducedRecord> {
        self.loops.members.get(&address)
    }

    /// The loop that absorbed `address`, if any.
    pub fn loop_of(&self, address: Address) -> Option<Address> {
        self.loops.member_of.get(&address).copied()
    }

    /// The is-a view: instances and bytes per type, heaviest first.
    pub fn type_summary(&self) -> &[TypeSummary] {
        &self.types
    }

    /// Bytes over every record of the dump as loaded.
    pub fn raw_total(&self) -> u64 {
        self.raw_total
    }

    /// Records of the dump dropped for reusing an address.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Bytes of those dropped records; not included in [`raw_total`](Self::raw_total).
    pub fn duplicate_bytes(&self) -> u64 {
        self.duplicate_bytes
    }

    pub fn module_total(&self) -> f64 {
        self.total_of(&self.modules)
    }

    pub fn unreachable_total(&self) -> f64 {
        self.total_of(&self.garbage)
    }

    fn total_of(&self, roots: &[Address]) -> f64 {
        roots
            .iter()
            .filter_map(|a| self.records.get(a))
            .map(|r| r.totsize)
            .sum()
    }
}

impl TreeModel for MemoryTree {
    type NodeId = MemoryNode;

    fn root(&self) -> MemoryNode {
        MemoryNode::Root
    }

    fn children(&self, node: MemoryNode) -> Vec<MemoryNode> {
        match node {
            MemoryNode::Root => {
                let mut children: Vec<MemoryNode> =
                    self.modules.iter().copied().map(MemoryNode::Record).collect();
                if !self.garbage.is_empty() {
                    children.push(MemoryNode::Unreachable);
                }
                children
            }
            MemoryNode::Unreachable => self.garbage.iter().copied().map(MemoryNode::Record).collect(),
            MemoryNode::Record(address) => self
                .records
                .get(&address)
                .map(|r| r.children.iter().copied().map(MemoryNode::Record).collect())
                .unwrap_or_default(),
        }
    }

    fn parents(&self, node: MemoryNode) -> Vec<MemoryNode> {
        match node {
            MemoryNode::Root => Vec::new(),
            MemoryNode::Unreachable => vec![MemoryNode::Root],
            MemoryNode::Record(address) => match self.records.get(&address) {
                Some(r) if !r.parents.is_empty() => {
                    r.parents.iter().copied().map(MemoryNode::Record).collect()
                }
                Some(_) if self.garbage.contains(&address) => vec![MemoryNode::Unreachable],
                Some(_) => vec![MemoryNode::Root],
                None => Vec::new(),
            },
        }
    }

    fn cumulative(&self, node: MemoryNode) -> f64 {
        match node {
            MemoryNode::Root => self.module_total() + self.unreachable_total(),
            MemoryNode::Unreachable => self.unreachable_total(),
            MemoryNode::Record(address) => self.records.get(&address).map_or(0.0, |r| r.totsize),
        }
    }

    fn local(&self, node: MemoryNode) -> f64 {
        match node {
            MemoryNode::Record(address) => {
                self.records.get(&address).map_or(0.0, |r| r.size as f64)
            }
            _ => 0.0,
        }
    }

    fn label(&self, node: MemoryNode) -> String {
        match node {
            MemoryNode::Root => self.name.to_string(),
            MemoryNode::Unreachable => "<unreachable>".to_string(),
            MemoryNode::Record(address) => self
                .records
                .get(&address)
                .map(ReducedRecord::label)
                .unwrap_or_else(|| address.to_string()),
        }
    }

    fn unit(&self) -> ValueUnit {
        ValueUnit::Bytes
    }

    fn child_value(&self, parent: MemoryNode, child: MemoryNode) -> f64 {
        match (parent, child) {
            (MemoryNode::Record(_), MemoryNode::Record(address)) => {
                self.records.get(&address).map_or(0.0, ReducedRecord::share)
            }
            _ => self.cumulative(child),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: Address, size: u64, children: Vec<Address>, parents: Vec<Address>) -> ReducedRecord {
        ReducedRecord {
            address,
            type_name: "moo".into(),
            name: None,
            kind: RecordKind::Object,
            size,
            children,
            parents,
            rsize: 0.0,
            totsize: size as f64,
        }
    }

    #[test]
    fn allocator_is_per_instance() {
        let mut a = AddressAllocator::new();
        let mut b = AddressAllocator::new();
        assert_eq!(a.mint(), Address::Synthetic(0));
        assert_eq!(a.mint(), Address::Synthetic(1));
        assert_eq!(b.mint(), Address::Synthetic(0));
        assert_eq!(a.minted(), 2);
        assert!(Address::Object(u64::MAX) < Address::Synthetic(0));
    }

    #[test]
    fn raw_record_ignores_extra_fields() {
        let raw: RawRecord = serde_json::from_str(
            r#"{"address": 7, "type": "str", "size": 40, "len": 3, "value": "abc"}"#,
        )
        .unwrap();
        assert_eq!(raw.type_name, "str");
        assert!(raw.refs.is_empty());
        assert_eq!(raw.name, None);
    }

    #[test]
    fn shared_children_split_their_value() {
        let m1 = Address::Object(1);
        let m2 = Address::Object(2);
        let shared = Address::Object(3);
        let mut records = BTreeMap::new();
        let mut a = record(m1, 2, vec![shared], vec![]);
        a.rsize = 5.0;
        a.totsize = 7.0;
        let mut b = record(m2, 1, vec![shared], vec![]);
        b.rsize = 5.0;
        b.totsize = 6.0;
        records.insert(m1, a);
        records.insert(m2, b);
        records.insert(shared, record(shared, 10, vec![], vec![m1, m2]));

        let tree = MemoryTree::new(
            "dump".into(),
            records,
            vec![m2, m1],
            vec![],
            LoopTable::default(),
            vec![],
            13,
        );

        assert_eq!(tree.modules(), &[m1, m2]);
        assert_eq!(tree.cumulative(MemoryNode::Root), 13.0);
        assert_eq!(tree.children(MemoryNode::Root).len(), 2);
        assert_eq!(
            tree.child_value(MemoryNode::Record(m1), MemoryNode::Record(shared)),
            5.0
        );
        assert_eq!(tree.parents(MemoryNode::Record(m1)), vec![MemoryNode::Root]);
        assert_eq!(tree.parents(MemoryNode::Record(shared)).len(), 2);
        assert_eq!(tree.label(MemoryNode::Record(shared)), "moo @3");
    }
}
