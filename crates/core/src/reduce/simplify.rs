use std::collections::HashSet;

use crate::config::ReduceOptions;

use super::index::{BackReferences, MemoryIndex};

/// Fold leaf records of a core scalar type into the records referring to
/// them.
///
/// With several referrers the size is split evenly in whole bytes; the
/// remainder goes one byte each to the first referrers in address order.
/// Leaves nobody refers to are left in place. Returns the number of
/// records absorbed.
pub fn simplify_core(index: &mut MemoryIndex, back: &BackReferences, options: &ReduceOptions) -> usize {
    let leaves: Vec<_> = index
        .iter()
        .filter(|r| r.is_object() && r.refs.is_empty() && options.is_core(&r.type_name))
        .map(|r| r.address)
        .collect();

    let mut absorbed = 0;
    for leaf in leaves {
        let referrers: Vec<_> = back
            .of(leaf)
            .iter()
            .copied()
            .filter(|&a| index.contains(a))
            .collect();
        if referrers.is_empty() {
            continue;
        }
        let Some(record) = index.remove(leaf) else {
            continue;
        };

        let count = referrers.len() as u64;
        let share = record.size / count;
        let remainder = record.size % count;
        for (i, referrer) in referrers.into_iter().enumerate() {
            if let Some(parent) = index.get_mut(referrer) {
                parent.size += share + u64::from((i as u64) < remainder);
                parent.refs.retain(|&a| a != leaf);
            }
        }
        absorbed += 1;
    }
    log::debug!("absorbed {absorbed} core records");
    absorbed
}

/// Inline wrapper containers (attribute dicts) into the single owner that
/// holds them.
///
/// The owner takes over the wrapper's size and its references, spliced in
/// where the wrapper was referenced. Returns the number of wrappers
/// removed; callers must rebuild back references afterwards.
pub fn simplify_dicts(index: &mut MemoryIndex, back: &BackReferences, options: &ReduceOptions) -> usize {
    let owners: Vec<_> = index
        .iter()
        .filter(|r| options.is_wrapper_owner(&r.type_name))
        .map(|r| r.address)
        .collect();

    let mut inlined = HashSet::new();
    for owner in owners {
        let Some(refs) = index.get(owner).map(|r| r.refs.clone()) else {
            continue;
        };

        let mut spliced = Vec::with_capacity(refs.len());
        let mut absorbed = 0;
        for target in refs {
            if inlined.contains(&target) {
                continue;
            }
            let is_private_wrapper = target != owner
                && back.of(target) == [owner]
                && index
                    .get(target)
                    .is_some_and(|c| c.is_object() && options.is_wrapper(&c.type_name));
            if is_private_wrapper && let Some(wrapper) = index.remove(target) {
                absorbed += wrapper.size;
                spliced.extend(wrapper.refs.into_iter().filter(|&a| a != target));
                inlined.insert(target);
                continue;
            }
            spliced.push(target);
        }

        if let Some(record) = index.get_mut(owner) {
            record.size += absorbed;
            record.refs = spliced;
        }
    }
    log::debug!("inlined {} wrapper records", inlined.len());
    inlined.len()
}
