//! Records created when an export is published.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Category assigned to every exported video.
pub const DEFAULT_CATEGORY: &str = "general";

/// Upper bound on stored tags per video.
pub const MAX_TAGS: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
    Unlisted,
}

impl Visibility {
    /// Case-insensitive parse; anything unrecognized (or missing) is public.
    pub fn parse_or_public(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("private") => Self::Private,
            Some("unlisted") => Self::Unlisted,
            _ => Self::Public,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Unlisted => "unlisted",
        }
    }

    pub fn from_db(value: &str) -> Self {
        Self::parse_or_public(Some(value))
    }
}

/// Splits a comma separated tag string into trimmed, lowercased, unique tags
/// in order of first appearance, keeping at most [`MAX_TAGS`].
pub fn normalize_tags(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    raw.split(',')
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .take(MAX_TAGS)
        .collect()
}

/// Random 11 character URL-safe id, the same shape as other video ids.
pub fn generate_video_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persisted result of a successful export. Written once, never updated by
/// the export pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedVideo {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub tags: Vec<String>,
    pub storage_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_key: Option<String>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline_name: Option<String>,
    pub created_at: String,
}
