use std::collections::{BTreeMap, HashMap, HashSet};

use runsnake_protocol::SharedStr;

use crate::config::ReduceOptions;
use crate::model::memory::{Address, LoopTable, MemoryTree, ReducedRecord};

use super::index::MemoryIndex;
use super::loops::{CollapsedLoops, cost_edges};

/// Assign every record its share of cost and freeze the result.
///
/// Cost flows along references that do not enter a root type (modules
/// never pay for other modules). Each record's children are visited before
/// it, from every root type record first and then from every remaining
/// record nobody refers to:
///
/// ```text
/// rsize   = Σ child.totsize / max(1, referrers(child))
/// totsize = size + rsize
/// ```
///
/// Loops were already collapsed, so the graph is acyclic here and a loop
/// is reached only through its external references.
pub fn recurse(
    name: SharedStr,
    mut index: MemoryIndex,
    collapsed: CollapsedLoops,
    options: &ReduceOptions,
) -> MemoryTree {
    let mut children: HashMap<Address, Vec<Address>> = HashMap::with_capacity(index.len());
    let mut parents: HashMap<Address, Vec<Address>> = HashMap::new();
    for record in index.iter() {
        let edges: Vec<Address> = cost_edges(&index, record, options).collect();
        for &child in &edges {
            parents.entry(child).or_default().push(record.address);
        }
        children.insert(record.address, edges);
    }

    let modules: Vec<Address> = index
        .iter()
        .filter(|r| options.is_root(&r.type_name))
        .map(|r| r.address)
        .collect();
    let garbage: Vec<Address> = index
        .iter()
        .filter(|r| !options.is_root(&r.type_name) && !parents.contains_key(&r.address))
        .map(|r| r.address)
        .collect();

    let mut totsize: HashMap<Address, (f64, f64)> = HashMap::with_capacity(index.len());
    let mut entered = HashSet::new();
    let mut stack: Vec<(Address, bool)> = Vec::new();
    for &root in modules.iter().chain(&garbage) {
        stack.push((root, false));
        while let Some((address, expanded)) = stack.pop() {
            if totsize.contains_key(&address) {
                continue;
            }
            let kids = children.get(&address).map_or(&[][..], Vec::as_slice);
            if !expanded {
                if !entered.insert(address) {
                    log::warn!("cycle through {address} after loop collapsing");
                    continue;
                }
                stack.push((address, true));
                stack.extend(
                    kids.iter()
                        .rev()
                        .filter(|c| !totsize.contains_key(*c))
                        .map(|&c| (c, false)),
                );
                continue;
            }

            let rsize: f64 = kids
                .iter()
                .map(|c| {
                    let share = parents.get(c).map_or(1, Vec::len).max(1) as f64;
                    totsize.get(c).map_or(0.0, |&(_, total)| total) / share
                })
                .sum();
            let size = index.get(address).map_or(0, |r| r.size) as f64;
            totsize.insert(address, (rsize, size + rsize));
        }
    }

    let unvisited = index.len() - totsize.len();
    if unvisited > 0 {
        log::warn!("{unvisited} records unreachable from any root");
    }

    let types = index.take_type_summary();
    let raw_total = index.raw_total();
    let (duplicates, duplicate_bytes) = (index.duplicates(), index.duplicate_bytes());
    let mut records = BTreeMap::new();
    for address in index.addresses() {
        let Some(record) = index.remove(address) else {
            continue;
        };
        let (rsize, total) = totsize.get(&address).copied().unwrap_or((0.0, record.size as f64));
        records.insert(
            address,
            ReducedRecord {
                address,
                type_name: record.type_name,
                name: record.name,
                kind: record.kind,
                size: record.size,
                children: children.remove(&address).unwrap_or_default(),
                parents: parents.remove(&address).unwrap_or_default(),
                rsize,
                totsize: total,
            },
        );
    }

    let loops = LoopTable {
        members: collapsed
            .members
            .into_iter()
            .map(|(address, member)| {
                let mut seen = HashSet::new();
                let record = member.record;
                let size = record.size;
                let children = record
                    .refs
                    .iter()
                    .copied()
                    .filter(|&r| r != address && seen.insert(r))
                    .collect();
                let reduced = ReducedRecord {
                    address,
                    type_name: record.type_name,
                    name: record.name,
                    kind: record.kind,
                    size,
                    children,
                    parents: member.parents,
                    rsize: 0.0,
                    totsize: size as f64,
                };
                (address, reduced)
            })
            .collect(),
        member_of: collapsed.member_of,
    };

    MemoryTree::new(name, records, modules, garbage, loops, types, raw_total)
        .with_duplicates(duplicates, duplicate_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::index::tests::{obj, raw};

    fn run(records: Vec<crate::model::memory::RawRecord>) -> MemoryTree {
        let index = MemoryIndex::build(records);
        recurse("dump".into(), index, CollapsedLoops::default(), &ReduceOptions::default())
    }

    #[test]
    fn shared_child_is_split_between_parents() {
        let tree = run(vec![
            raw(1, "module", 1, &[3]),
            raw(2, "module", 1, &[3]),
            raw(3, "list", 8, &[4]),
            raw(4, "moo", 2, &[]),
        ]);
        let list = tree.record(obj(3)).unwrap();
        assert_eq!(list.totsize, 10.0);
        assert_eq!(list.parents, vec![obj(1), obj(2)]);
        assert_eq!(tree.record(obj(1)).unwrap().totsize, 6.0);
        assert_eq!(tree.record(obj(2)).unwrap().rsize, 5.0);
        assert_eq!(tree.module_total(), 12.0);
        assert!(tree.garbage().is_empty());
    }

    #[test]
    fn modules_do_not_pay_for_modules() {
        let tree = run(vec![
            raw(1, "module", 3, &[2]),
            raw(2, "module", 4, &[1]),
        ]);
        assert_eq!(tree.record(obj(1)).unwrap().totsize, 3.0);
        assert_eq!(tree.record(obj(2)).unwrap().totsize, 4.0);
        assert_eq!(tree.modules(), &[obj(2), obj(1)]);
    }

    #[test]
    fn unreferenced_records_become_garbage_roots() {
        let tree = run(vec![
            raw(1, "module", 1, &[]),
            raw(2, "list", 3, &[3]),
            raw(3, "moo", 4, &[]),
        ]);
        assert_eq!(tree.garbage(), &[obj(2)]);
        assert_eq!(tree.unreachable_total(), 7.0);
        assert_eq!(tree.module_total() + tree.unreachable_total(), tree.raw_total() as f64);
    }

    #[test]
    fn deep_chains_do_not_overflow() {
        let n = 100_000u64;
        let mut records: Vec<_> = (1..n).map(|i| raw(i, "node", 1, &[i + 1])).collect();
        records.push(raw(n, "node", 1, &[]));
        records.push(raw(0, "module", 1, &[1]));
        let tree = run(records);
        assert_eq!(tree.module_total(), (n + 1) as f64);
    }
}
