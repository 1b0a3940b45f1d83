use std::collections::{BTreeMap, HashSet};

use runsnake_protocol::SharedStr;

use crate::config::ReduceOptions;
use crate::model::memory::{Address, RecordKind};

use super::index::{BackReferences, IndexedRecord, MemoryIndex};

/// Fold large runs of same-type leaves into one group record per type.
///
/// A child qualifies when it is a plain object with no references of its
/// own, is not a root type, and nobody but this parent refers to it. Once
/// `group_threshold` children of one type qualify, they are removed and the
/// parent refers to a single group holding their combined size instead.
/// Returns the number of groups created.
pub fn group_children(index: &mut MemoryIndex, back: &BackReferences, options: &ReduceOptions) -> usize {
    let threshold = options.group_threshold.max(2);
    let mut created = 0;

    for parent in index.addresses() {
        let Some(record) = index.get(parent) else {
            continue;
        };

        let mut by_type: BTreeMap<SharedStr, Vec<Address>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for &target in &record.refs {
            if target == parent || !seen.insert(target) {
                continue;
            }
            let Some(child) = index.get(target) else {
                continue;
            };
            let simple = child.is_object()
                && child.refs.is_empty()
                && !options.is_root(&child.type_name)
                && back.of(target).iter().all(|&p| p == parent);
            if simple {
                by_type.entry(child.type_name.clone()).or_default().push(target);
            }
        }

        for (type_name, members) in by_type {
            if members.len() < threshold {
                continue;
            }
            let address = index.mint();
            let size = members.iter().filter_map(|&m| index.remove(m)).map(|r| r.size).sum();
            index.insert(IndexedRecord {
                address,
                type_name,
                name: None,
                kind: RecordKind::Group { count: members.len() },
                size,
                refs: Vec::new(),
            });

            let members: HashSet<Address> = members.into_iter().collect();
            if let Some(record) = index.get_mut(parent) {
                let mut placed = false;
                record.refs.retain_mut(|r| {
                    if !members.contains(r) {
                        return true;
                    }
                    if placed {
                        return false;
                    }
                    *r = address;
                    placed = true;
                    true
                });
            }
            created += 1;
        }
    }
    log::debug!("created {created} groups");
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::index::tests::{obj, raw};

    fn fan_out(leaves: u64) -> MemoryIndex {
        let mut records = vec![
            raw(1, "module", 1, &[2]),
            raw(3, "str", 5, &[]),
        ];
        let mut refs = vec![3];
        for leaf in 0..leaves {
            let address = 100 + leaf;
            records.push(raw(address, "moo", 2, &[]));
            refs.push(address);
        }
        records.push(raw(2, "list", 4, &refs));
        MemoryIndex::build(records)
    }

    #[test]
    fn ten_same_type_leaves_become_one_group() {
        let mut index = fan_out(10);
        assert_eq!(index.len(), 13);
        let back = index.back_references();
        let created = group_children(&mut index, &back, &ReduceOptions::default());

        assert_eq!(created, 1);
        assert_eq!(index.len(), 4);
        assert!((100..110).all(|a| !index.contains(obj(a))));

        let list = index.get(obj(2)).unwrap();
        assert_eq!(list.refs.len(), 2);
        assert_eq!(list.refs[0], obj(3));
        let group = index.get(list.refs[1]).unwrap();
        assert_eq!(group.type_name, "moo");
        assert_eq!(group.kind, RecordKind::Group { count: 10 });
        assert_eq!(group.size, 20);
        assert!(group.refs.is_empty());
        assert_eq!(index.total_size(), 30);
    }

    #[test]
    fn below_threshold_is_untouched() {
        let mut index = fan_out(9);
        let back = index.back_references();
        assert_eq!(group_children(&mut index, &back, &ReduceOptions::default()), 0);
        assert_eq!(index.len(), 12);
    }

    #[test]
    fn leaves_shared_with_another_parent_are_not_grouped() {
        let mut index = fan_out(10);
        index.insert(IndexedRecord {
            address: obj(50),
            type_name: "tuple".into(),
            name: None,
            kind: RecordKind::Object,
            size: 1,
            refs: vec![obj(100)],
        });
        let back = index.back_references();
        assert_eq!(group_children(&mut index, &back, &ReduceOptions::default()), 0);
        assert!(index.contains(obj(100)));
    }
}
