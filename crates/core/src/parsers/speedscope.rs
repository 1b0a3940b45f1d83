use std::sync::Arc;

use runsnake_protocol::{Interner, SharedStr, ValueUnit};
use serde::Deserialize;
use thiserror::Error;

use crate::model::stack_tree::{Frame, StackError, StackProfiles, StackTree};

#[derive(Debug, Error)]
pub enum SpeedscopeParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema or missing profiles")]
    Unsupported,
    #[error(transparent)]
    Frame(#[from] StackError),
}

/// Speedscope file format, evented and sampled profiles.
/// Schema: https://www.speedscope.app/file-format-spec.json
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeedscopeFile {
    #[serde(default)]
    shared: Option<SharedData>,
    profiles: Vec<SpeedscopeProfile>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    active_profile_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SharedData {
    frames: Vec<SpeedscopeFrame>,
}

#[derive(Debug, Deserialize)]
struct SpeedscopeFrame {
    name: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<i64>,
    #[serde(default)]
    col: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SpeedscopeProfile {
    #[serde(rename = "evented")]
    Evented {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_unit")]
        unit: String,
        #[serde(rename = "endValue")]
        end_value: f64,
        events: Vec<SpeedscopeEvent>,
    },
    #[serde(rename = "sampled")]
    Sampled {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_unit")]
        unit: String,
        samples: Vec<Vec<usize>>,
        #[serde(default)]
        weights: Vec<f64>,
    },
}

#[derive(Debug, Deserialize)]
struct SpeedscopeEvent {
    #[serde(rename = "type")]
    event_type: String, // "O" (open) or "C" (close)
    frame: usize,
    at: f64,
}

fn default_unit() -> String {
    "none".to_string()
}

/// Parse a speedscope JSON file into one stack trie per profile.
pub fn parse_speedscope(data: &[u8]) -> Result<StackProfiles, SpeedscopeParseError> {
    let file: SpeedscopeFile = serde_json::from_slice(data)?;
    if file.profiles.is_empty() {
        return Err(SpeedscopeParseError::Unsupported);
    }

    let mut names = Interner::new();
    let frames: Arc<[Frame]> = file
        .shared
        .as_ref()
        .map(|s| &s.frames[..])
        .unwrap_or(&[])
        .iter()
        .enumerate()
        .map(|(index, frame)| Frame {
            index,
            name: names.intern(&frame.name),
            file: frame.file.as_deref().map(|f| names.intern(f)),
            line: frame.line,
            col: frame.col,
        })
        .collect();

    let mut profiles = Vec::with_capacity(file.profiles.len());
    for (position, profile) in file.profiles.iter().enumerate() {
        let tree = match profile {
            SpeedscopeProfile::Sampled {
                name,
                unit,
                samples,
                weights,
            } => {
                let unit = if weights.is_empty() && unit == "none" {
                    ValueUnit::Samples
                } else {
                    ValueUnit::from_speedscope(unit)
                };
                let mut tree = StackTree::new(profile_name(name, position), unit, frames.clone());
                for (i, sample) in samples.iter().enumerate() {
                    tree.add_sample(sample, weights.get(i).copied().unwrap_or(1.0))?;
                }
                if weights.len() > samples.len() {
                    log::warn!("{}: {} weights for {} samples", tree.name(), weights.len(), samples.len());
                }
                tree
            }
            SpeedscopeProfile::Evented {
                name,
                unit,
                end_value,
                events,
            } => {
                let mut tree = StackTree::new(
                    profile_name(name, position),
                    ValueUnit::from_speedscope(unit),
                    frames.clone(),
                );
                replay_events(&mut tree, events, *end_value)?;
                tree
            }
        };
        if tree.skipped_samples() > 0 {
            log::debug!("{}: skipped {} empty samples", tree.name(), tree.skipped_samples());
        }
        profiles.push(tree);
    }

    let mut active = file.active_profile_index.unwrap_or(0);
    if active >= profiles.len() {
        log::warn!("active profile {active} out of range, using the first");
        active = 0;
    }
    log::info!("speedscope: {} profiles, {} frames", profiles.len(), frames.len());

    Ok(StackProfiles {
        name: file.name.map(SharedStr::from),
        profiles,
        active,
    })
}

fn profile_name(name: &Option<String>, position: usize) -> SharedStr {
    match name {
        Some(name) => SharedStr::from(name.as_str()),
        None => SharedStr::from(format!("profile {position}")),
    }
}

/// Time between consecutive events is credited to the stack open during
/// it; frames still open at the end run until `end_value`.
fn replay_events(tree: &mut StackTree, events: &[SpeedscopeEvent], end_value: f64) -> Result<(), StackError> {
    let mut stack: Vec<usize> = Vec::new();
    let mut last_at: Option<f64> = None;

    for event in events {
        if let Some(last) = last_at
            && event.at > last
        {
            tree.add_interval(&stack, event.at - last)?;
        }
        last_at = Some(event.at);

        match event.event_type.as_str() {
            "O" => {
                stack.push(event.frame);
                tree.record_call(&stack)?;
            }
            "C" => match stack.iter().rposition(|&frame| frame == event.frame) {
                Some(position) => {
                    if position + 1 != stack.len() {
                        log::warn!("{}: frame {} closed out of order", tree.name(), event.frame);
                    }
                    stack.truncate(position);
                }
                None => log::warn!("{}: close of frame {} that is not open", tree.name(), event.frame),
            },
            other => log::warn!("{}: skipping unknown event type {other:?}", tree.name()),
        }
    }

    if let Some(last) = last_at
        && !stack.is_empty()
        && end_value > last
    {
        tree.add_interval(&stack, end_value - last)?;
    }
    Ok(())
}
