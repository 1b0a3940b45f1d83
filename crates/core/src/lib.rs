//! Data-model construction for runsnake.
//!
//! Loaders turn flat profiler and memory-dump records into hierarchies that
//! implement [`runsnake_protocol::TreeModel`]:
//!
//! - [`parsers::hotshot`] streams a raw call-event log into a [`model::CallGraph`],
//! - [`parsers::pstats`] weaves pre-aggregated call statistics into the same graph,
//! - [`parsers::meliae`] and [`reduce`] turn an object dump into a [`model::MemoryTree`],
//! - [`parsers::speedscope`] folds stack samples into a [`model::StackTree`].

pub mod config;
pub mod model;
pub mod parsers;
pub mod reduce;

pub use config::{LoaderConfig, ReduceOptions};
pub use parsers::{LoadError, ParseError, detect_format, load_path, parse_as, parse_auto};
