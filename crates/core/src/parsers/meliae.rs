use std::io::BufRead;

use runsnake_protocol::SharedStr;
use thiserror::Error;

use crate::config::ReduceOptions;
use crate::model::memory::{MemoryTree, RawRecord};
use crate::reduce::{ReduceError, reduce};

#[derive(Debug, Error)]
pub enum MeliaeParseError {
    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

/// Read a memory dump: one JSON object per line, each with at least
/// `address`, `type` and `size`.
pub fn parse_meliae(reader: impl BufRead) -> Result<Vec<RawRecord>, MeliaeParseError> {
    let mut records = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let record = serde_json::from_str(text).map_err(|source| MeliaeParseError::Json {
            line: number + 1,
            source,
        })?;
        records.push(record);
    }
    log::debug!("meliae dump: {} records", records.len());
    Ok(records)
}

/// Read a dump and reduce it to a cost tree.
pub fn load_meliae(
    reader: impl BufRead,
    name: impl Into<SharedStr>,
    options: &ReduceOptions,
) -> Result<MemoryTree, MeliaeParseError> {
    let records = parse_meliae(reader)?;
    Ok(reduce(name, records, options)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::memory::Address;
    use runsnake_protocol::TreeModel;

    const DUMP: &str = r#"
{"address": 1, "type": "module", "size": 100, "name": "app", "refs": [2]}
{"address": 2, "type": "dict", "size": 50, "len": 2, "refs": [3, 4]}
{"address": 3, "type": "str", "size": 40, "value": "greeting"}
{"address": 4, "type": "list", "size": 60, "refs": [5]}
{"address": 5, "type": "int", "size": 24, "value": 7}
"#;

    #[test]
    fn extra_fields_are_ignored() {
        let records = parse_meliae(DUMP.as_bytes()).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].name.as_deref(), Some("app"));
        assert_eq!(records[1].refs, vec![3, 4]);
        assert!(records[2].refs.is_empty());
    }

    #[test]
    fn dump_reduces_to_one_module() {
        let options = ReduceOptions {
            verify: true,
            ..ReduceOptions::default()
        };
        let tree = load_meliae(DUMP.as_bytes(), "dump", &options).unwrap();

        assert_eq!(tree.raw_total(), 274);
        assert_eq!(tree.modules(), &[Address::Object(1)]);
        let module = tree.record(Address::Object(1)).unwrap();
        assert_eq!(module.size, 190);
        assert_eq!(module.totsize, 274.0);
        assert_eq!(tree.cumulative(tree.root()), 274.0);
        assert!(tree.record(Address::Object(3)).is_none());
    }

    #[test]
    fn bad_line_reports_its_number() {
        let dump = "{\"address\": 1, \"type\": \"module\", \"size\": 1}\n\nnot json\n";
        match parse_meliae(dump.as_bytes()) {
            Err(MeliaeParseError::Json { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
