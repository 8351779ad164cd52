//! Parsing of client-submitted cut lists.
//!
//! Clients send loosely typed JSON (ids as strings or numbers, trim points as
//! numbers or numeric strings). Everything is funnelled through
//! [`normalize_timeline`], which applies one set of fallback rules:
//!
//! * the source id is the first non-empty of `videoId` and `id`;
//! * `start`, `in` and `out` default to `0` when missing or `null`;
//! * clips with an empty id, a non-finite number, `out <= in` or a negative
//!   `start` are dropped;
//! * survivors are sorted by `start`, keeping input order for ties.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One trimmed source clip placed on the output timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSpec {
    #[serde(rename = "videoId")]
    pub source_id: String,
    #[serde(rename = "start")]
    pub timeline_start: f64,
    #[serde(rename = "in")]
    pub trim_in: f64,
    #[serde(rename = "out")]
    pub trim_out: f64,
}

impl ClipSpec {
    /// Length of the extracted range in seconds. Always positive for clips
    /// that survived normalization.
    pub fn duration(&self) -> f64 {
        self.trim_out - self.trim_in
    }
}

/// Clips sorted by timeline position with invalid entries removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NormalizedTimeline(Vec<ClipSpec>);

impl NormalizedTimeline {
    pub fn clips(&self) -> &[ClipSpec] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all clip durations, i.e. the length of the concatenated output.
    pub fn total_duration(&self) -> f64 {
        self.0.iter().map(ClipSpec::duration).sum()
    }

    /// Distinct source ids in order of first appearance.
    pub fn distinct_source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for clip in &self.0 {
            if !ids.iter().any(|id| id == &clip.source_id) {
                ids.push(clip.source_id.clone());
            }
        }
        ids
    }
}

/// Turns arbitrary client JSON into a [`NormalizedTimeline`].
///
/// Non-array input yields an empty timeline; the caller decides whether that
/// is an error.
pub fn normalize_timeline(raw: &Value) -> NormalizedTimeline {
    let Some(entries) = raw.as_array() else {
        return NormalizedTimeline::default();
    };

    let mut clips: Vec<ClipSpec> = entries.iter().filter_map(parse_clip).collect();
    // `sort_by` is stable, so equal starts keep their submission order.
    clips.sort_by(|a, b| a.timeline_start.total_cmp(&b.timeline_start));
    NormalizedTimeline(clips)
}

fn parse_clip(entry: &Value) -> Option<ClipSpec> {
    let source_id = coerce_id(entry.get("videoId"))
        .or_else(|| coerce_id(entry.get("id")))?;

    let timeline_start = coerce_number(entry.get("start"));
    let trim_in = coerce_number(entry.get("in"));
    let trim_out = coerce_number(entry.get("out"));

    if !timeline_start.is_finite() || !trim_in.is_finite() || !trim_out.is_finite() {
        return None;
    }
    if trim_out <= trim_in || timeline_start < 0.0 {
        return None;
    }

    Some(ClipSpec {
        source_id,
        timeline_start,
        trim_in,
        trim_out,
    })
}

fn coerce_id(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

fn coerce_number(value: Option<&Value>) -> f64 {
    match value {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(number)) => number.as_f64().unwrap_or(f64::NAN),
        Some(Value::Bool(flag)) => {
            if *flag {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => f64::NAN,
    }
}
