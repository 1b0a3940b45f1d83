//! Loader configuration.
//!
//! Every field has a default, so an empty TOML table (or no file at all)
//! yields a working configuration.

use serde::{Deserialize, Serialize};

/// Events consumed between two progress snapshots of the event-log loader.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Call-stack slots reserved up front; the stack grows past this on demand.
pub const DEFAULT_STACK_DEPTH: usize = 2_000;

/// Same-type siblings needed before they are folded into one group node.
pub const DEFAULT_GROUP_THRESHOLD: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub initial_stack_depth: usize,
    pub reduce: ReduceOptions,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            initial_stack_depth: DEFAULT_STACK_DEPTH,
            reduce: ReduceOptions::default(),
        }
    }
}

/// Knobs for the memory-graph reduction passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceOptions {
    /// Scalar leaf types folded into the objects that reference them.
    pub core_types: Vec<String>,
    /// Aggregates whose private attribute dictionaries get inlined.
    pub wrapper_owner_types: Vec<String>,
    /// Container types that can be inlined into an owner.
    pub wrapper_types: Vec<String>,
    /// Types that start a cost hierarchy; references into them carry no cost.
    pub root_types: Vec<String>,
    pub group_threshold: usize,
    /// Re-check byte conservation after every pass.
    pub verify: bool,
}

impl ReduceOptions {
    pub fn is_core(&self, type_name: &str) -> bool {
        self.core_types.iter().any(|t| t == type_name)
    }

    pub fn is_wrapper_owner(&self, type_name: &str) -> bool {
        self.wrapper_owner_types.iter().any(|t| t == type_name)
    }

    pub fn is_wrapper(&self, type_name: &str) -> bool {
        self.wrapper_types.iter().any(|t| t == type_name)
    }

    pub fn is_root(&self, type_name: &str) -> bool {
        self.root_types.iter().any(|t| t == type_name)
    }
}

impl Default for ReduceOptions {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|s| (*s).to_string()).collect();
        Self {
            core_types: owned(&[
                "str", "unicode", "bytes", "int", "long", "float", "bool", "complex", "NoneType",
            ]),
            wrapper_owner_types: owned(&["module", "type", "classobj"]),
            wrapper_types: owned(&["dict"]),
            root_types: owned(&["module"]),
            group_threshold: DEFAULT_GROUP_THRESHOLD,
            verify: cfg!(debug_assertions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: LoaderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LoaderConfig::default());
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.reduce.is_core("str"));
        assert!(config.reduce.is_root("module"));
    }

    #[test]
    fn partial_reduce_section_keeps_other_defaults() {
        let config: LoaderConfig =
            serde_json::from_str(r#"{"reduce": {"group_threshold": 3}}"#).unwrap();
        assert_eq!(config.reduce.group_threshold, 3);
        assert!(config.reduce.is_wrapper("dict"));
        assert_eq!(config.initial_stack_depth, DEFAULT_STACK_DEPTH);
    }
}
