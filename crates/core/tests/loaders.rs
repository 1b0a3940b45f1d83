//! Integration tests: load each fixture through `load_path` and check the
//! hierarchies the loaders build.

use std::io::Write;

use runsnake_core::model::{Address, CallNode, Dataset, FunctionId, LocationNode, LocationTree, RecordKind, Session, ViewKind};
use runsnake_core::parsers::meliae::MeliaeParseError;
use runsnake_core::{LoadError, LoaderConfig, ParseError, load_path};
use runsnake_protocol::{SourceFormat, TreeModel, snapshot};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Copy a fixture into a scratch directory so loads go through the file
/// system like they do from the command line.
fn fixture_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(data).unwrap();
    path
}

fn verifying() -> LoaderConfig {
    let mut config = LoaderConfig::default();
    config.reduce.verify = true;
    config
}

#[test]
fn event_log_builds_call_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture_file(&dir, "run.log", include_bytes!("fixtures/hotshot-sample.jsonl"));

    let (dataset, format) = load_path(&path, None, &LoaderConfig::default()).unwrap();
    assert_eq!(format, SourceFormat::Hotshot);
    let Dataset::Calls(graph) = &dataset else {
        panic!("expected a call graph");
    };

    assert_eq!(graph.root(), CallNode::Function(FunctionId(0)));
    let main = graph.function(FunctionId(0)).unwrap();
    let work = graph.function(FunctionId(1)).unwrap();
    let helper = graph.function(FunctionId(2)).unwrap();
    assert_eq!(work.calls, 2);
    assert!(approx(main.local, 30e-6));
    assert!(approx(main.cumulative, 125e-6));
    assert!(approx(work.local, 65e-6));
    assert!(approx(work.cumulative, 95e-6));
    assert!(approx(helper.cumulative, 30e-6));
    assert_eq!(graph.children(CallNode::Function(FunctionId(1))), vec![CallNode::Function(FunctionId(2))]);

    let edge = work.edge_from(FunctionId(0)).unwrap();
    assert_eq!(edge.calls, 2);
    assert!(approx(edge.cumulative, 95e-6));

    let location = LocationTree::build(graph);
    assert_eq!(location.groups().len(), 3);
    let lib = location.group_of(FunctionId(2)).unwrap();
    assert_eq!(location.group_of(FunctionId(1)), Some(lib));
    assert!(approx(location.cumulative(LocationNode::Group(lib)), 125e-6));
    assert_eq!(location.label(LocationNode::Group(lib)), "/src/lib");
}

#[test]
fn pstats_dump_builds_call_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture_file(&dir, "sample.prof", include_bytes!("fixtures/sample.pstats"));

    let (dataset, format) = load_path(&path, None, &LoaderConfig::default()).unwrap();
    assert_eq!(format, SourceFormat::PStats);
    let Dataset::Calls(graph) = &dataset else {
        panic!("expected a call graph");
    };

    assert_eq!(graph.functions().len(), 4);
    assert_eq!(graph.roots().len(), 1);
    let root = graph.root();
    assert!(graph.label(root).starts_with("main@app.py"));
    assert!(approx(graph.cumulative(root), 0.1));
    for function in graph.functions().iter() {
        assert!(function.local <= function.cumulative);
    }

    let work = graph.children(root);
    assert_eq!(work.len(), 1);
    let CallNode::Function(work) = work[0] else {
        panic!("expected a function");
    };
    assert_eq!(graph.function(work).map(|f| f.children.len()), Some(2));
    assert!(approx(graph.child_cumulative_time(root, work), 0.81));
}

#[test]
fn memory_dump_reduces_and_conserves_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture_file(&dir, "memdump.jsonl", include_bytes!("fixtures/memdump.jsonl"));

    let (dataset, format) = load_path(&path, None, &verifying()).unwrap();
    assert_eq!(format, SourceFormat::Meliae);
    let Dataset::Memory(tree) = &dataset else {
        panic!("expected a memory tree");
    };

    assert_eq!(tree.name().as_str(), "memdump.jsonl");
    assert_eq!(tree.raw_total(), 1350);
    assert!(approx(tree.cumulative(tree.root()), 1350.0));
    assert_eq!(tree.modules(), &[Address::Object(1), Address::Object(40)]);
    assert_eq!(tree.garbage(), &[Address::Object(30)]);

    let app = tree.record(Address::Object(1)).unwrap();
    assert_eq!(app.size, 350);
    assert!(approx(app.totsize, 1157.0));
    let sys = tree.record(Address::Object(40)).unwrap();
    assert!(approx(sys.totsize, 105.0));

    let cycle = tree.loop_of(Address::Object(4)).unwrap();
    assert_eq!(tree.loop_of(Address::Object(5)), Some(cycle));
    let record = tree.record(cycle).unwrap();
    assert_eq!(record.size, 110);
    assert_eq!(record.parents, vec![Address::Object(1), Address::Object(40)]);
    assert_eq!(tree.loop_members(cycle).len(), 2);

    let list = tree.record(Address::Object(10)).unwrap();
    assert_eq!(list.children.len(), 1);
    let group = tree.record(list.children[0]).unwrap();
    assert_eq!(group.kind, RecordKind::Group { count: 12 });
    assert_eq!(group.size, 672);

    let tuples = &tree.type_summary()[0];
    assert_eq!(tuples.type_name, "tuple");
    assert_eq!(tuples.count, 13);
    assert_eq!(tuples.bytes, 736);
}

#[test]
fn sampled_stacks_build_a_trie() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture_file(&dir, "profile.json", include_bytes!("fixtures/pyspy-sample.json"));

    let (dataset, format) = load_path(&path, None, &LoaderConfig::default()).unwrap();
    assert_eq!(format, SourceFormat::Speedscope);
    let Dataset::Samples(profiles) = &dataset else {
        panic!("expected sampled stacks");
    };
    let tree = profiles.active().unwrap();

    assert_eq!(tree.roots().len(), 3);
    let sum: f64 = tree.roots().iter().map(|&id| tree.cumulative(id)).sum();
    assert_eq!(sum, 8.0);
    assert_eq!(tree.local(tree.root()), 0.0);
    assert_eq!(tree.skipped_samples(), 1);

    let work = tree.get(&[0, 1, 2]).unwrap();
    assert_eq!(tree.cumulative(work), 3.0);
    assert_eq!(tree.local(work), 3.0);
    assert_eq!(tree.label(work), "work@lib.py:5");
}

#[test]
fn session_collects_loaded_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let config = verifying();
    let mut session = Session::new();
    for (name, data) in [
        ("run.log", &include_bytes!("fixtures/hotshot-sample.jsonl")[..]),
        ("memdump.jsonl", &include_bytes!("fixtures/memdump.jsonl")[..]),
        ("profile.json", &include_bytes!("fixtures/pyspy-sample.json")[..]),
    ] {
        let path = fixture_file(&dir, name, data);
        let (dataset, format) = load_path(&path, None, &config).unwrap();
        session.add(dataset, format, name);
    }

    assert_eq!(session.len(), 3);
    let memory = session.find("memdump.jsonl").unwrap();
    assert_eq!(memory.dataset.default_view(), ViewKind::Memory);
    let snap = memory.dataset.snapshot(ViewKind::Memory, 2).unwrap();
    assert_eq!(snap.root.children.len(), 3);
    assert_eq!(snap.root.children[0].label.as_str(), "module app");

    let calls = &session.entries()[0].dataset;
    let location = calls.snapshot(ViewKind::Location, 3).unwrap();
    assert_eq!(location.root.label.as_str(), "PYTHONPATH");
    if let Dataset::Calls(graph) = calls {
        let json = serde_json::to_string(&snapshot(graph, 8)).unwrap();
        assert!(json.contains("helper@util.py:20"));
    }
}

#[test]
fn explicit_format_overrides_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture_file(&dir, "memdump.jsonl", include_bytes!("fixtures/memdump.jsonl"));

    let err = load_path(&path, Some(SourceFormat::Speedscope), &LoaderConfig::default()).unwrap_err();
    assert!(matches!(err, LoadError::Parse { source: ParseError::Speedscope(_), .. }));
}

#[test]
fn load_errors_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoaderConfig::default();

    let missing = dir.path().join("missing.prof");
    let err = load_path(&missing, None, &config).unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }));
    assert!(err.to_string().contains("missing.prof"));

    let unknown = fixture_file(&dir, "notes.txt", b"nothing to see here\n");
    let err = load_path(&unknown, None, &config).unwrap_err();
    assert!(matches!(err, LoadError::UnknownFormat { .. }));

    let broken = fixture_file(
        &dir,
        "broken.jsonl",
        b"{\"address\": 1, \"type\": \"module\", \"size\": 8}\n{\"address\": 2,\n",
    );
    match load_path(&broken, None, &config) {
        Err(LoadError::Parse {
            path,
            source: ParseError::Meliae(MeliaeParseError::Json { line, .. }),
        }) => {
            assert_eq!(path, broken);
            assert_eq!(line, 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
