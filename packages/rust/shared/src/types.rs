//! Core domain types for Markwise runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for source record identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new time-sortable record identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// SourceRecord
// ---------------------------------------------------------------------------

/// A bookmark as supplied by the record feed. Read-only within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: RecordId,
    /// Name the user gave the bookmark in its source.
    pub display_name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl SourceRecord {
    /// Build a record with a fresh id and the current timestamp.
    pub fn new(display_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            display_name: display_name.into(),
            url: url.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Which pipeline step produced a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scrape,
    Metadata,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::MarkwiseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(Self::Scrape),
            "metadata" => Ok(Self::Metadata),
            other => Err(crate::MarkwiseError::validation(format!(
                "unknown cache stage '{other}'"
            ))),
        }
    }
}

/// Stable content-addressable key for a `(url, stage)` pair.
///
/// The unit separator keeps `("a", scrape)` and `("scrapea", ..)`-style
/// concatenations from colliding.
pub fn cache_key(url: &str, stage: Stage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A persisted cache row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub url: String,
    pub stage: Stage,
    /// JSON-encoded payload ([`ScrapeResult`] or [`GeneratedMetadata`]).
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Pipeline payloads
// ---------------------------------------------------------------------------

/// Cleaned page content produced by the content fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub url: String,
    /// Extracted text, bounded by the configured maximum length.
    pub text: String,
    /// `<title>` of the page, empty if the page had none.
    #[serde(default)]
    pub source_title: String,
    /// Set when no body text was obtainable and `text` is only the title.
    #[serde(default)]
    pub title_only: bool,
}

/// Semantic name and description generated for one bookmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedMetadata {
    pub url: String,
    pub name: String,
    pub description: String,
    /// LLM tokens consumed producing this entry.
    #[serde(default)]
    pub cost_units: u64,
    /// Derived from a title-only scrape.
    #[serde(default)]
    pub title_only: bool,
}

// ---------------------------------------------------------------------------
// FolderNode
// ---------------------------------------------------------------------------

/// A folder in the output taxonomy. Children are exclusively owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bookmarks: Vec<GeneratedMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subfolders: Vec<FolderNode>,
}

impl FolderNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bookmarks: Vec::new(),
            subfolders: Vec::new(),
        }
    }

    /// Total bookmarks in this folder and all descendants.
    pub fn bookmark_count(&self) -> usize {
        self.bookmarks.len()
            + self
                .subfolders
                .iter()
                .map(FolderNode::bookmark_count)
                .sum::<usize>()
    }

    /// Number of descendant folders (not counting `self`).
    pub fn folder_count(&self) -> usize {
        self.subfolders
            .iter()
            .map(|f| 1 + f.folder_count())
            .sum()
    }

    /// Levels of folders below this node; a leaf folder has depth 0.
    pub fn depth(&self) -> usize {
        self.subfolders
            .iter()
            .map(|f| 1 + f.depth())
            .max()
            .unwrap_or(0)
    }

    /// Every bookmark URL in the subtree, depth-first.
    pub fn urls(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.bookmark_count());
        self.collect_urls(&mut out);
        out
    }

    fn collect_urls<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.extend(self.bookmarks.iter().map(|b| b.url.as_str()));
        for folder in &self.subfolders {
            folder.collect_urls(out);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty() && self.subfolders.is_empty()
    }
}
