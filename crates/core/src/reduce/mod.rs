//! Memory-graph reduction.
//!
//! A meliae dump is a flat object graph. [`reduce`] turns it into a
//! [`MemoryTree`] in six passes, each of which keeps every byte of the dump
//! accounted for exactly once:
//!
//! 1. index records and derive back references,
//! 2. absorb core scalar leaves into their referrers ([`simplify_core`]),
//! 3. inline private attribute dicts into their owners ([`simplify_dicts`]),
//! 4. collapse reference cycles into loop records ([`find_loops`]),
//! 5. fold wide same-type fan-out into group records ([`group_children`]),
//! 6. propagate shared cost bottom-up ([`recurse`]).

pub mod group;
pub mod index;
pub mod loops;
pub mod recurse;
pub mod simplify;

use runsnake_protocol::SharedStr;
use serde::Serialize;
use thiserror::Error;

use crate::config::ReduceOptions;
use crate::model::memory::{MemoryTree, RawRecord};

pub use group::group_children;
pub use index::{BackReferences, IndexedRecord, MemoryIndex};
pub use loops::{CollapsedLoops, LoopMember, find_loops};
pub use recurse::recurse;
pub use simplify::{simplify_core, simplify_dicts};

/// Relative slack allowed when comparing fractional cost shares against the
/// byte total.
const COST_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pass {
    Index,
    Core,
    Dicts,
    Loops,
    Groups,
    Recurse,
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Index => "index",
            Self::Core => "core absorption",
            Self::Dicts => "dict inlining",
            Self::Loops => "loop collapsing",
            Self::Groups => "child grouping",
            Self::Recurse => "cost propagation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReduceError {
    #[error("{pass} changed the byte total from {expected} to {actual}")]
    ByteDrift { pass: Pass, expected: u64, actual: u64 },
    #[error("{pass} attributed {actual} bytes to roots, dump holds {expected}")]
    CostDrift { pass: Pass, expected: u64, actual: f64 },
}

/// Bytes held by the index must still equal the dump total.
pub fn check_bytes(pass: Pass, index: &MemoryIndex) -> Result<(), ReduceError> {
    let expected = index.raw_total();
    let actual = index.total_size();
    if actual == expected {
        Ok(())
    } else {
        Err(ReduceError::ByteDrift { pass, expected, actual })
    }
}

/// Cost summed over module and unreachable roots must equal the dump total.
pub fn check_cost(tree: &MemoryTree) -> Result<(), ReduceError> {
    let expected = tree.raw_total();
    let actual = tree.module_total() + tree.unreachable_total();
    let slack = COST_TOLERANCE * (expected as f64).max(1.0);
    if (actual - expected as f64).abs() <= slack {
        Ok(())
    } else {
        Err(ReduceError::CostDrift {
            pass: Pass::Recurse,
            expected,
            actual,
        })
    }
}

/// Run every pass over `records` and build the cost tree.
pub fn reduce(
    name: impl Into<SharedStr>,
    records: impl IntoIterator<Item = RawRecord>,
    options: &ReduceOptions,
) -> Result<MemoryTree, ReduceError> {
    let verify = |pass, index: &MemoryIndex| {
        if options.verify {
            check_bytes(pass, index)
        } else {
            Ok(())
        }
    };

    let mut index = MemoryIndex::build(records);
    verify(Pass::Index, &index)?;
    let raw_records = index.len();

    let back = index.back_references();
    let absorbed = simplify_core(&mut index, &back, options);
    verify(Pass::Core, &index)?;

    let back = index.back_references();
    let inlined = simplify_dicts(&mut index, &back, options);
    verify(Pass::Dicts, &index)?;

    let collapsed = find_loops(&mut index, options);
    verify(Pass::Loops, &index)?;

    let back = index.back_references();
    let grouped = group_children(&mut index, &back, options);
    verify(Pass::Groups, &index)?;

    log::debug!(
        "reduced {raw_records} records to {}: {absorbed} absorbed, {inlined} inlined, {} loops, {grouped} groups",
        index.len(),
        collapsed.loops.len()
    );

    let tree = recurse(name.into(), index, collapsed, options);
    if options.verify {
        check_cost(&tree)?;
    }
    log::info!(
        "memory tree {}: {} records, {} modules, {} unreachable roots, {} bytes ({:.0} to modules, {:.0} unreachable), {} duplicate records dropped with {} bytes",
        tree.name(),
        tree.len(),
        tree.modules().len(),
        tree.garbage().len(),
        tree.raw_total(),
        tree.module_total(),
        tree.unreachable_total(),
        tree.duplicates(),
        tree.duplicate_bytes()
    );
    Ok(tree)
}
