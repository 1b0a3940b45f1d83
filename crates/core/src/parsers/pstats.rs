use std::collections::{BTreeMap, HashMap};

use runsnake_protocol::Interner;
use thiserror::Error;

use super::marshal::{self, MarshalError, Value};
use crate::model::call_graph::{CallEdge, CallGraph, CallGraphError, CallStats, FileTable, FunctionTable};

#[derive(Debug, Error)]
pub enum StatsParseError {
    #[error("marshal: {0}")]
    Marshal(#[from] MarshalError),
    #[error("unexpected layout: {0}")]
    Layout(String),
    #[error(transparent)]
    Graph(#[from] CallGraphError),
}

/// A function as `pstats` names it. Builtins use the file `~` and line 0,
/// so the name is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatsKey {
    pub file: String,
    pub line: u32,
    pub name: String,
}

impl StatsKey {
    pub fn new(file: impl Into<String>, line: u32, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            name: name.into(),
        }
    }
}

/// Pre-aggregated statistics for one function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsEntry {
    pub stats: CallStats,
    /// Contribution of each caller to this function's totals.
    pub callers: BTreeMap<StatsKey, CallStats>,
}

pub type StatsTable = BTreeMap<StatsKey, StatsEntry>;

/// Build a call graph from already-summed statistics.
///
/// Times are taken as given. Callers missing from the table are dropped.
pub fn load_stats(table: &StatsTable) -> Result<CallGraph, StatsParseError> {
    let mut files = FileTable::new();
    let mut functions = FunctionTable::new();
    let mut names = Interner::new();
    let mut ids = HashMap::with_capacity(table.len());

    for (key, entry) in table {
        let file = files.intern_path(&key.file);
        let id = functions.push(names.intern(&key.name), file, key.line);
        // Builtins all sit at `~:0`; they have no definition line to index.
        if key.line > 0
            && let Some(record) = files.get_mut(file)
        {
            record.functions.entry(key.line).or_insert(id);
        }
        if let Some(record) = functions.get_mut(id) {
            record.calls = entry.stats.calls;
            record.recursive = entry.stats.recursive;
            record.local = entry.stats.local;
            record.cumulative = entry.stats.cumulative;
        }
        ids.insert(key, id);
    }

    let mut unresolved = 0usize;
    for (key, entry) in table {
        let Some(&id) = ids.get(key) else {
            continue;
        };
        let edges: Vec<CallEdge> = entry
            .callers
            .iter()
            .filter_map(|(caller, stats)| match ids.get(caller) {
                Some(&caller) => Some(CallEdge { caller, stats: *stats }),
                None => {
                    unresolved += 1;
                    None
                }
            })
            .collect();
        if let Some(record) = functions.get_mut(id) {
            record.callers = edges;
        }
    }
    if unresolved > 0 {
        log::debug!("{unresolved} callers not found in the statistics table");
    }

    Ok(CallGraph::weave(files, functions, 0.0)?)
}

/// Decode a `pstats` dump (a marshalled dict) into a statistics table.
///
/// Each value is `(primitive calls, total calls, own time, cumulative time,
/// callers)`; caller values are the same four numbers or, from the old
/// `profile` module, a bare call count.
pub fn parse_pstats(data: &[u8]) -> Result<StatsTable, StatsParseError> {
    let Value::Dict(entries) = marshal::decode(data)? else {
        return Err(layout("top level is not a dict"));
    };

    let mut table = StatsTable::new();
    for (key, value) in &entries {
        let key = stats_key(key)?;
        let fields = value
            .as_seq()
            .filter(|f| f.len() == 5)
            .ok_or_else(|| layout(format!("{}: expected a 5-tuple", key.name)))?;
        let stats = call_stats(&fields[..4]).ok_or_else(|| layout(format!("{}: bad counters", key.name)))?;

        let Value::Dict(raw_callers) = &fields[4] else {
            return Err(layout(format!("{}: callers is not a dict", key.name)));
        };
        let mut callers = BTreeMap::new();
        for (caller, contribution) in raw_callers {
            let caller = stats_key(caller)?;
            let stats = match contribution {
                Value::Int(calls) => Some(CallStats {
                    calls: u64::try_from(*calls).unwrap_or(0),
                    ..CallStats::default()
                }),
                other => other.as_seq().filter(|f| f.len() == 4).and_then(call_stats),
            }
            .ok_or_else(|| layout(format!("{}: bad caller entry", key.name)))?;
            callers.insert(caller, stats);
        }

        table.insert(key, StatsEntry { stats, callers });
    }
    log::debug!("pstats table with {} functions", table.len());
    Ok(table)
}

/// Decode and load a `pstats` dump in one step.
pub fn load_pstats(data: &[u8]) -> Result<CallGraph, StatsParseError> {
    let table = parse_pstats(data)?;
    let graph = load_stats(&table)?;
    log::info!("pstats: {} functions, {} roots", graph.functions().len(), graph.roots().len());
    Ok(graph)
}

fn layout(message: impl Into<String>) -> StatsParseError {
    StatsParseError::Layout(message.into())
}

fn stats_key(value: &Value) -> Result<StatsKey, StatsParseError> {
    match value.as_seq() {
        Some([file, line, name]) => {
            let file = file.as_str().ok_or_else(|| layout("function key file is not a string"))?;
            let line = line
                .as_i64()
                .and_then(|l| u32::try_from(l).ok())
                .ok_or_else(|| layout("function key line is not a line number"))?;
            let name = name.as_str().ok_or_else(|| layout("function key name is not a string"))?;
            Ok(StatsKey::new(file, line, name))
        }
        _ => Err(layout("function key is not a (file, line, name) tuple")),
    }
}

/// `(primitive calls, total calls, own time, cumulative time)`.
fn call_stats(fields: &[Value]) -> Option<CallStats> {
    let [primitive, total, local, cumulative] = fields else {
        return None;
    };
    let primitive = u64::try_from(primitive.as_i64()?).ok()?;
    let calls = u64::try_from(total.as_i64()?).ok()?;
    Some(CallStats {
        calls,
        recursive: calls.saturating_sub(primitive),
        local: local.as_f64()?,
        cumulative: cumulative.as_f64()?,
    })
}
