//! Streaming loader for hotshot call-event logs.
//!
//! The log is a flat sequence of `[what, delta, file, line]` records, one
//! JSON array per line. `what` is a hotshot `WHAT_*` code or its name; for
//! the two definition kinds the delta slot carries the file or function
//! name instead of a tick count.
//!
//! ```text
//! [35, "/src/app.py", 1, 0]        DEFINE_FILE      file 1 = /src/app.py
//! [67, "main", 1, 10]              DEFINE_FUNCTION  (1, 10) = main
//! [0, 0, 1, 10]                    ENTER main
//! [32, 150, 1, 12]                 LINE, 150 ticks in main
//! [16, 40, 0, 0]                   EXIT, 40 more ticks in main
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;

use runsnake_protocol::{Interner, SharedStr};
use serde::Deserialize;
use thiserror::Error;

use crate::config::LoaderConfig;
use crate::model::call_graph::{
    CallEdge, CallGraph, CallGraphError, CallStats, FileId, FileTable, FunctionId, FunctionTable,
};

/// Hotshot timestamps are microsecond ticks.
pub const SECONDS_PER_TICK: f64 = 1e-6;

pub const WHAT_ENTER: i64 = 0x00;
pub const WHAT_EXIT: i64 = 0x10;
pub const WHAT_LINENO: i64 = 0x20;
pub const WHAT_DEFINE_FILE: i64 = 0x23;
pub const WHAT_DEFINE_FUNC: i64 = 0x43;

#[derive(Debug, Error)]
pub enum EventLogParseError {
    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: {what} expects a {expected}")]
    Payload {
        line: usize,
        what: &'static str,
        expected: &'static str,
    },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Graph(#[from] CallGraphError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enter { delta: u64, file: u32, line: u32 },
    Exit { delta: u64 },
    Line { delta: u64, file: u32, line: u32 },
    DefineFile { file: u32, name: String },
    DefineFunction { file: u32, line: u32, name: String },
    /// A record kind this loader does not know; skipped with a warning.
    Unknown { what: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tag {
    Code(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    Ticks(u64),
    Text(String),
}

type RawEvent = (Tag, Payload, u32, u32);

impl Event {
    fn from_raw((tag, payload, file, line): RawEvent, at: usize) -> Result<Self, EventLogParseError> {
        let what = match tag {
            Tag::Code(WHAT_ENTER) => "ENTER",
            Tag::Code(WHAT_EXIT) => "EXIT",
            Tag::Code(WHAT_LINENO) => "LINE",
            Tag::Code(WHAT_DEFINE_FILE) => "DEFINE_FILE",
            Tag::Code(WHAT_DEFINE_FUNC) => "DEFINE_FUNCTION",
            Tag::Code(other) => {
                return Ok(Self::Unknown {
                    what: format!("{other:#x}"),
                });
            }
            Tag::Name(name) => match name.as_str() {
                "ENTER" => "ENTER",
                "EXIT" => "EXIT",
                "LINE" | "LINENO" => "LINE",
                "DEFINE_FILE" => "DEFINE_FILE",
                "DEFINE_FUNCTION" | "DEFINE_FUNC" => "DEFINE_FUNCTION",
                _ => return Ok(Self::Unknown { what: name.clone() }),
            },
        };

        let ticks = |payload: Payload| match payload {
            Payload::Ticks(delta) => Ok(delta),
            Payload::Text(_) => Err(EventLogParseError::Payload {
                line: at,
                what,
                expected: "tick count",
            }),
        };
        let text = |payload: Payload| match payload {
            Payload::Text(name) => Ok(name),
            Payload::Ticks(_) => Err(EventLogParseError::Payload {
                line: at,
                what,
                expected: "name",
            }),
        };

        Ok(match what {
            "ENTER" => Self::Enter {
                delta: ticks(payload)?,
                file,
                line,
            },
            "EXIT" => Self::Exit {
                delta: ticks(payload)?,
            },
            "LINE" => Self::Line {
                delta: ticks(payload)?,
                file,
                line,
            },
            "DEFINE_FILE" => Self::DefineFile {
                file,
                name: text(payload)?,
            },
            _ => Self::DefineFunction {
                file,
                line,
                name: text(payload)?,
            },
        })
    }
}

/// Reads events from a newline-delimited JSON log. Blank lines and lines
/// starting with `#` are skipped.
pub struct EventLogReader<R> {
    reader: R,
    buf: String,
    line: usize,
}

impl<R: BufRead> EventLogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for EventLogReader<R> {
    type Item = Result<Event, EventLogParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;
            let trimmed = self.buf.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let at = self.line;
            return Some(
                serde_json::from_str::<RawEvent>(trimmed)
                    .map_err(|source| EventLogParseError::Json { line: at, source })
                    .and_then(|raw| Event::from_raw(raw, at)),
            );
        }
    }
}

/// An open call on the loader's stack.
#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    /// `None` when the event named a function that was never defined.
    function: Option<FunctionId>,
    own_ticks: u64,
    child_ticks: u64,
    /// No other frame below this one runs the same function.
    outermost: bool,
    /// Entered with no known function open below it.
    top_level: bool,
}

/// Partial results handed back between batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchSnapshot<'a> {
    pub events_processed: usize,
    pub finished: bool,
    pub files: &'a FileTable,
    pub functions: &'a FunctionTable,
}

/// Resumable aggregation of an event stream into file and function tables.
///
/// The host calls [`process_next_batch`](Self::process_next_batch) as often
/// as it likes, inspecting the partial tables in between, and finally
/// [`finish`](Self::finish) to weave the call graph.
pub struct EventLogLoader<I> {
    events: I,
    files: FileTable,
    functions: FunctionTable,
    names: Interner,
    by_key: HashMap<(u32, u32), FunctionId>,
    stack: Vec<ActiveFrame>,
    edges: HashMap<(FunctionId, FunctionId), CallStats>,
    top_level: BTreeMap<FunctionId, CallStats>,
    unattributed_ticks: u64,
    events_processed: usize,
    skipped: usize,
    underflows: usize,
    finished: bool,
}

impl<I> EventLogLoader<I>
where
    I: Iterator<Item = Result<Event, EventLogParseError>>,
{
    pub fn new(events: I, config: &LoaderConfig) -> Self {
        Self {
            events,
            files: FileTable::new(),
            functions: FunctionTable::new(),
            names: Interner::new(),
            by_key: HashMap::new(),
            stack: Vec::with_capacity(config.initial_stack_depth),
            edges: HashMap::new(),
            top_level: BTreeMap::new(),
            unattributed_ticks: 0,
            events_processed: 0,
            skipped: 0,
            underflows: 0,
            finished: false,
        }
    }

    /// Consume up to `count` events.
    pub fn process_next_batch(&mut self, count: usize) -> Result<BatchSnapshot<'_>, EventLogParseError> {
        for _ in 0..count {
            match self.events.next() {
                Some(event) => {
                    self.apply(event?);
                    self.events_processed += 1;
                }
                None => {
                    self.finished = true;
                    break;
                }
            }
        }
        log::debug!(
            "{} events processed, {} functions, stack depth {}",
            self.events_processed,
            self.functions.len(),
            self.stack.len()
        );
        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> BatchSnapshot<'_> {
        BatchSnapshot {
            events_processed: self.events_processed,
            finished: self.finished,
            files: &self.files,
            functions: &self.functions,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Seconds that could not be attributed to any known function so far.
    pub fn unattributed_seconds(&self) -> f64 {
        self.unattributed_ticks as f64 * SECONDS_PER_TICK
    }

    /// Drain the remaining events, close any calls left open and weave the
    /// call graph.
    pub fn finish(mut self) -> Result<CallGraph, EventLogParseError> {
        while !self.finished {
            self.process_next_batch(usize::MAX)?;
        }
        if !self.stack.is_empty() {
            log::debug!("closing {} calls still open at end of log", self.stack.len());
        }
        while !self.stack.is_empty() {
            self.exit();
        }
        if self.skipped > 0 || self.underflows > 0 {
            log::warn!(
                "{} unrecognised events skipped, {} exits without a matching enter",
                self.skipped,
                self.underflows
            );
        }

        let mut edges: Vec<_> = self.edges.into_iter().collect();
        edges.sort_by_key(|&(key, _)| key);
        for ((caller, callee), stats) in edges {
            if let Some(record) = self.functions.get_mut(callee) {
                record.callers.push(CallEdge { caller, stats });
            }
        }

        let unattributed = self.unattributed_ticks as f64 * SECONDS_PER_TICK;
        log::info!(
            "event log: {} events, {} functions, {} files, {unattributed:.6}s unattributed",
            self.events_processed,
            self.functions.len(),
            self.files.len()
        );
        Ok(CallGraph::weave_with_roots(
            self.files,
            self.functions,
            self.top_level,
            unattributed,
        )?)
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Enter { delta, file, line } => {
                self.credit(delta);
                self.enter(file, line);
            }
            Event::Exit { delta } => {
                self.credit(delta);
                self.exit();
            }
            Event::Line { delta, .. } => self.credit(delta),
            Event::DefineFile { file, name } => {
                let name = self.names.intern(&name);
                self.files.define(FileId(file), name);
            }
            Event::DefineFunction { file, line, name } => {
                let name = self.names.intern(&name);
                self.define_function(file, line, name);
            }
            Event::Unknown { what } => {
                self.skipped += 1;
                log::warn!("unrecognised event {what} at event {}", self.events_processed);
            }
        }
    }

    /// Elapsed ticks belong to whatever was running before the event.
    fn credit(&mut self, delta: u64) {
        match self.stack.last_mut() {
            Some(top) => top.own_ticks += delta,
            None => self.unattributed_ticks += delta,
        }
    }

    fn define_function(&mut self, file: u32, line: u32, name: SharedStr) {
        if let Some(&id) = self.by_key.get(&(file, line)) {
            if let Some(record) = self.functions.get_mut(id) {
                record.name = name;
            }
            return;
        }
        let id = self.functions.push(name, FileId(file), line);
        self.by_key.insert((file, line), id);
        if let Some(record) = self.files.get_mut(FileId(file)) {
            record.functions.insert(line, id);
        }
    }

    fn enter(&mut self, file: u32, line: u32) {
        let function = self.by_key.get(&(file, line)).copied();
        let recursive = function.is_some_and(|f| self.stack.iter().any(|frame| frame.function == Some(f)));
        let top_level = function.is_some() && self.stack.iter().all(|frame| frame.function.is_none());

        if let Some(id) = function {
            if top_level {
                self.top_level.entry(id).or_default().calls += 1;
            }
            if let Some(record) = self.functions.get_mut(id) {
                record.calls += 1;
                record.recursive += u64::from(recursive);
            }
            if let Some(caller) = self.stack.last().and_then(|frame| frame.function) {
                let edge = self.edges.entry((caller, id)).or_default();
                edge.calls += 1;
                edge.recursive += u64::from(recursive);
            }
        }

        self.stack.push(ActiveFrame {
            function,
            own_ticks: 0,
            child_ticks: 0,
            outermost: !recursive,
            top_level,
        });
    }

    fn exit(&mut self) {
        let Some(frame) = self.stack.pop() else {
            self.underflows += 1;
            log::warn!("frame underflow at event {}", self.events_processed);
            return;
        };
        let own = frame.own_ticks as f64 * SECONDS_PER_TICK;
        let total_ticks = frame.own_ticks + frame.child_ticks;

        match frame.function {
            Some(id) => {
                if let Some(record) = self.functions.get_mut(id) {
                    record.local += own;
                }
            }
            None => self.unattributed_ticks += frame.own_ticks,
        }
        if frame.top_level
            && let Some(id) = frame.function
        {
            let stats = self.top_level.entry(id).or_default();
            stats.local += own;
            stats.cumulative += total_ticks as f64 * SECONDS_PER_TICK;
        }

        // Own time counts once toward every function on the stack,
        // credited at that function's outermost open instance.
        let open = self
            .stack
            .iter()
            .chain(std::iter::once(&frame))
            .filter(|f| f.outermost)
            .filter_map(|f| f.function);
        for id in open {
            if let Some(record) = self.functions.get_mut(id) {
                record.cumulative += own;
            }
        }

        if let Some(parent) = self.stack.last_mut() {
            parent.child_ticks += total_ticks;
            if let (Some(caller), Some(callee)) = (parent.function, frame.function) {
                let edge = self.edges.entry((caller, callee)).or_default();
                edge.local += own;
                edge.cumulative += total_ticks as f64 * SECONDS_PER_TICK;
            }
        }
    }
}

/// Aggregate already-decoded events.
pub fn load_events(
    events: impl IntoIterator<Item = Event>,
    config: &LoaderConfig,
) -> Result<CallGraph, EventLogParseError> {
    EventLogLoader::new(events.into_iter().map(Ok), config).finish()
}

/// Parse and aggregate a whole event log.
pub fn parse_event_log(reader: impl BufRead, config: &LoaderConfig) -> Result<CallGraph, EventLogParseError> {
    let mut loader = EventLogLoader::new(EventLogReader::new(reader), config);
    let batch = config.batch_size.max(1);
    while !loader.process_next_batch(batch)?.finished {}
    loader.finish()
}
