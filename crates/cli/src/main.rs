//! runsnake: load a call profile, memory dump or sampled-stack file and
//! print its hierarchy as an indented outline or as a JSON snapshot.

mod outline;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use runsnake_core::LoaderConfig;
use runsnake_core::model::{Dataset, ViewKind};
use runsnake_protocol::SourceFormat;

#[derive(Parser, Debug)]
#[command(name = "runsnake")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Profile, memory dump or speedscope file to load
    file: PathBuf,

    /// Input format; detected from the content when omitted
    #[arg(short, long)]
    format: Option<FormatArg>,

    /// Hierarchy to print; defaults to the first view the input supports
    #[arg(long)]
    view: Option<ViewArg>,

    /// Levels below the root to print
    #[arg(short, long, default_value = "6")]
    depth: usize,

    /// Print a JSON snapshot instead of an outline
    #[arg(long)]
    json: bool,

    /// Print per-type totals of a memory dump after the outline
    #[arg(long)]
    types: bool,

    /// TOML file with loader settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Hotshot,
    Pstats,
    Meliae,
    Speedscope,
}

impl From<FormatArg> for SourceFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Hotshot => Self::Hotshot,
            FormatArg::Pstats => Self::PStats,
            FormatArg::Meliae => Self::Meliae,
            FormatArg::Speedscope => Self::Speedscope,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ViewArg {
    Functions,
    Location,
    Memory,
    Samples,
}

impl From<ViewArg> for ViewKind {
    fn from(arg: ViewArg) -> Self {
        match arg {
            ViewArg::Functions => Self::Functions,
            ViewArg::Location => Self::Location,
            ViewArg::Memory => Self::Memory,
            ViewArg::Samples => Self::Samples,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let config = match &cli.config {
        Some(path) => read_config(path)?,
        None => LoaderConfig::default(),
    };

    let (dataset, format) = runsnake_core::load_path(&cli.file, cli.format.map(Into::into), &config)
        .with_context(|| format!("failed to load {}", cli.file.display()))?;
    log::info!("loaded {} as {format}", cli.file.display());

    let view = cli.view.map_or_else(|| dataset.default_view(), Into::into);
    let snapshot = dataset.snapshot(view, cli.depth).with_context(|| {
        let supported: Vec<String> = dataset.views().iter().map(ToString::to_string).collect();
        format!("{format} input has no {view} view (supported: {})", supported.join(", "))
    })?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if cli.json {
        serde_json::to_writer_pretty(&mut out, &snapshot)?;
        writeln!(out)?;
    } else {
        outline::write_outline(&mut out, &snapshot)?;
    }

    if cli.types {
        match &dataset {
            Dataset::Memory(tree) => outline::write_type_summary(&mut out, tree)?,
            _ => log::warn!("--types only applies to memory dumps"),
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<LoaderConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}
