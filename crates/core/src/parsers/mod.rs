pub mod hotshot;
pub mod marshal;
pub mod meliae;
pub mod pstats;
pub mod speedscope;

use std::path::{Path, PathBuf};

use runsnake_protocol::SourceFormat;
use thiserror::Error;

use crate::config::LoaderConfig;
use crate::model::Dataset;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("hotshot: {0}")]
    Hotshot(#[from] hotshot::EventLogParseError),
    #[error("pstats: {0}")]
    PStats(#[from] pstats::StatsParseError),
    #[error("meliae: {0}")]
    Meliae(#[from] meliae::MeliaeParseError),
    #[error("speedscope: {0}")]
    Speedscope(#[from] speedscope::SpeedscopeParseError),
    #[error("unable to detect format")]
    UnknownFormat,
}

/// A failed load, with the file it came from.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("{}: unable to detect format", .path.display())]
    UnknownFormat { path: PathBuf },
}

/// Guess the format of `data` from its first bytes.
///
/// Detection strategy:
/// 1. A marshalled dict (optionally flagged as a ref) is a `pstats` dump.
/// 2. A whole-document JSON object is speedscope, or a one-record memory dump.
/// 3. Otherwise the first non-blank line decides: an array is an event-log
///    entry, an object with an `address` is a memory-dump record.
pub fn detect_format(data: &[u8]) -> Option<SourceFormat> {
    match data.first() {
        Some(0xFB) => return Some(SourceFormat::PStats),
        Some(b'{') if data.get(1).is_some_and(|&b| b == b')' || b == b'(' || b == 0xA9 || b == 0xA8) => {
            return Some(SourceFormat::PStats);
        }
        _ => {}
    }

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data)
        && let Some(obj) = value.as_object()
    {
        if obj.get("$schema").and_then(|s| s.as_str()).is_some_and(|s| s.contains("speedscope")) {
            return Some(SourceFormat::Speedscope);
        }
        if obj.contains_key("shared") && obj.contains_key("profiles") {
            return Some(SourceFormat::Speedscope);
        }
        if obj.contains_key("address") {
            return Some(SourceFormat::Meliae);
        }
    }

    let text = std::str::from_utf8(data).ok()?;
    let first = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))?;
    match serde_json::from_str::<serde_json::Value>(first).ok()? {
        serde_json::Value::Array(_) => Some(SourceFormat::Hotshot),
        serde_json::Value::Object(obj) if obj.contains_key("address") => Some(SourceFormat::Meliae),
        _ => None,
    }
}

/// Parse `data` as `format`. `name` labels memory trees.
pub fn parse_as(
    data: &[u8],
    format: SourceFormat,
    name: &str,
    config: &LoaderConfig,
) -> Result<Dataset, ParseError> {
    Ok(match format {
        SourceFormat::Hotshot => Dataset::Calls(hotshot::parse_event_log(data, config)?),
        SourceFormat::PStats => Dataset::Calls(pstats::load_pstats(data)?),
        SourceFormat::Meliae => Dataset::Memory(meliae::load_meliae(data, name, &config.reduce)?),
        SourceFormat::Speedscope => Dataset::Samples(speedscope::parse_speedscope(data)?),
    })
}

/// Auto-detect the input format and parse it.
pub fn parse_auto(data: &[u8], config: &LoaderConfig) -> Result<(Dataset, SourceFormat), ParseError> {
    let format = detect_format(data).ok_or(ParseError::UnknownFormat)?;
    log::debug!("detected {format} input");
    Ok((parse_as(data, format, "dump", config)?, format))
}

/// Read and parse the file at `path`, detecting its format unless one is
/// given.
pub fn load_path(
    path: &Path,
    format: Option<SourceFormat>,
    config: &LoaderConfig,
) -> Result<(Dataset, SourceFormat), LoadError> {
    let data = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let format = match format.or_else(|| detect_format(&data)) {
        Some(format) => format,
        None => {
            return Err(LoadError::UnknownFormat {
                path: path.to_path_buf(),
            });
        }
    };
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    log::info!("loading {} as {format}", path.display());

    let dataset = parse_as(&data, format, &name, config).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((dataset, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::marshal::{Value, tests::encode};

    #[test]
    fn detects_each_format() {
        let events = b"# comment\n[\"DEFINE_FILE\", \"main.py\", 1, 0]\n";
        assert_eq!(detect_format(events), Some(SourceFormat::Hotshot));

        let dump = b"{\"address\": 1, \"type\": \"module\", \"size\": 4}\n{\"address\": 2, \"type\": \"str\", \"size\": 4}\n";
        assert_eq!(detect_format(dump), Some(SourceFormat::Meliae));
        assert_eq!(detect_format(&dump[..44]), Some(SourceFormat::Meliae));

        let samples = br#"{"shared": {"frames": []}, "profiles": []}"#;
        assert_eq!(detect_format(samples), Some(SourceFormat::Speedscope));

        let stats = Value::Dict(vec![(
            Value::Tuple(vec![Value::Str("a.py".into()), Value::Int(1), Value::Str("f".into())]),
            Value::None,
        )]);
        assert_eq!(detect_format(&encode(&stats)), Some(SourceFormat::PStats));
    }

    #[test]
    fn unknown_input() {
        assert_eq!(detect_format(b""), None);
        assert_eq!(detect_format(b"hello world"), None);
        assert_eq!(detect_format(b"{\"traceEvents\": []}"), None);
        assert!(matches!(
            parse_auto(b"42", &LoaderConfig::default()),
            Err(ParseError::UnknownFormat)
        ));
    }

    #[test]
    fn parse_auto_reports_format() {
        let events = "[\"DEFINE_FILE\", \"main.py\", 1, 0]\n\
                      [\"DEFINE_FUNCTION\", \"main\", 1, 1]\n\
                      [\"ENTER\", 0, 1, 1]\n\
                      [\"EXIT\", 5, 0, 0]\n";
        let (dataset, format) = parse_auto(events.as_bytes(), &LoaderConfig::default()).unwrap();
        assert_eq!(format, SourceFormat::Hotshot);
        assert!(matches!(dataset, Dataset::Calls(_)));
    }
}
