use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::ReduceOptions;
use crate::model::memory::{Address, RecordKind};

use super::index::{BackReferences, IndexedRecord, MemoryIndex};

pub const LOOP_TYPE: &str = "<loop>";

/// A record that was folded into a loop, with the referrers it had then.
#[derive(Debug, Clone)]
pub struct LoopMember {
    pub record: IndexedRecord,
    pub parents: Vec<Address>,
}

/// Side table produced by [`find_loops`].
#[derive(Debug, Default)]
pub struct CollapsedLoops {
    pub members: BTreeMap<Address, LoopMember>,
    pub member_of: HashMap<Address, Address>,
    pub loops: Vec<Address>,
}

/// Targets of `record` that carry cost: present in the index, not the
/// record itself, not a root type. Distinct, in reference order.
pub(crate) fn cost_edges<'a>(
    index: &'a MemoryIndex,
    record: &'a IndexedRecord,
    options: &'a ReduceOptions,
) -> impl Iterator<Item = Address> + 'a {
    let mut seen = HashSet::new();
    record.refs.iter().copied().filter(move |&target| {
        target != record.address
            && index
                .get(target)
                .is_some_and(|t| !options.is_root(&t.type_name))
            && seen.insert(target)
    })
}

/// Strongly connected components with more than one member, each sorted by
/// address. Tarjan's algorithm on an explicit stack.
pub fn strongly_connected(index: &MemoryIndex, options: &ReduceOptions) -> Vec<Vec<Address>> {
    let nodes = index.addresses();
    let position: HashMap<Address, usize> = nodes.iter().enumerate().map(|(i, &a)| (a, i)).collect();
    let edges: Vec<Vec<usize>> = nodes
        .iter()
        .map(|&a| match index.get(a) {
            Some(record) => cost_edges(index, record, options)
                .filter_map(|t| position.get(&t).copied())
                .collect(),
            None => Vec::new(),
        })
        .collect();

    const UNVISITED: usize = usize::MAX;
    let mut order = vec![UNVISITED; nodes.len()];
    let mut low = vec![0; nodes.len()];
    let mut on_stack = vec![false; nodes.len()];
    let mut stack = Vec::new();
    let mut work: Vec<(usize, usize)> = Vec::new();
    let mut next = 0;
    let mut components = Vec::new();

    for start in 0..nodes.len() {
        if order[start] != UNVISITED {
            continue;
        }
        order[start] = next;
        low[start] = next;
        next += 1;
        stack.push(start);
        on_stack[start] = true;
        work.push((start, 0));

        while let Some(&(v, edge)) = work.last() {
            if let Some(&w) = edges[v].get(edge) {
                if let Some(top) = work.last_mut() {
                    top.1 += 1;
                }
                if order[w] == UNVISITED {
                    order[w] = next;
                    low[w] = next;
                    next += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    work.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(order[w]);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                low[parent] = low[parent].min(low[v]);
            }
            if low[v] == order[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(nodes[w]);
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 {
                    component.sort();
                    components.push(component);
                }
            }
        }
    }
    components
}

/// Collapse every reference cycle into one `<loop>` record.
///
/// A loop's size is the sum of its members', its references are the
/// members' references leaving the loop, and every reference into a member
/// is redirected to the loop. Members move to the returned side table.
pub fn find_loops(index: &mut MemoryIndex, options: &ReduceOptions) -> CollapsedLoops {
    let components = strongly_connected(index, options);
    let back = BackReferences::build(index);
    let loop_type = index.intern(LOOP_TYPE);
    let mut collapsed = CollapsedLoops::default();

    for members in components {
        let address = index.mint();
        let inside: HashSet<Address> = members.iter().copied().collect();
        let mut size = 0;
        let mut refs = Vec::new();
        let mut seen = HashSet::new();

        for &member in &members {
            let Some(record) = index.remove(member) else {
                continue;
            };
            size += record.size;
            refs.extend(
                record
                    .refs
                    .iter()
                    .copied()
                    .filter(|r| !inside.contains(r) && seen.insert(*r)),
            );
            collapsed.member_of.insert(member, address);
            collapsed.members.insert(
                member,
                LoopMember {
                    record,
                    parents: back.of(member).to_vec(),
                },
            );
        }

        log::debug!("loop {address}: {} members, {size} bytes", members.len());
        index.insert(IndexedRecord {
            address,
            type_name: loop_type.clone(),
            name: None,
            kind: RecordKind::Loop { members },
            size,
            refs,
        });
        collapsed.loops.push(address);
    }

    if !collapsed.member_of.is_empty() {
        for record in index.iter_mut() {
            if !record.refs.iter().any(|r| collapsed.member_of.contains_key(r)) {
                continue;
            }
            let mut seen = HashSet::new();
            let own = record.address;
            record.refs = record
                .refs
                .iter()
                .map(|r| collapsed.member_of.get(r).copied().unwrap_or(*r))
                .filter(|&r| r != own && seen.insert(r))
                .collect();
        }
    }
    collapsed
}
