//! Feed collaborator: where candidates come from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Candidate;

/// One item produced by a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Candidate(Candidate),
    /// A source item that could not be turned into a candidate.
    Malformed {
        source_item_id: String,
        discovered_at: DateTime<Utc>,
        reason: String,
    },
}

impl FeedItem {
    pub fn discovered_at(&self) -> DateTime<Utc> {
        match self {
            FeedItem::Candidate(c) => c.discovered_at,
            FeedItem::Malformed { discovered_at, .. } => *discovered_at,
        }
    }
}

/// Pull-based source of candidates.
#[async_trait]
pub trait Feed: Send + Sync {
    /// Items discovered at or after `since`, oldest first. When more than
    /// `limit` match, only the newest `limit` are returned.
    async fn fetch(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<FeedItem>>;
}

/// Reads candidates from `*.json` files in a spool directory.
///
/// A file holds one candidate object or an array of them. Missing
/// `source_item_id` defaults to the file stem, missing `discovered_at` to
/// the file's modification time.
pub struct SpoolFeed {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpoolFile {
    Many(Vec<SpoolCandidate>),
    One(SpoolCandidate),
}

#[derive(Debug, Deserialize)]
struct SpoolCandidate {
    source_item_id: Option<String>,
    discovered_at: Option<DateTime<Utc>>,
    candidate_reference: String,
    #[serde(default)]
    raw_payload: serde_json::Value,
}

impl SpoolFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<FeedItem>> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified: DateTime<Utc> = tokio::fs::metadata(path)
            .await?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let content = tokio::fs::read_to_string(path).await?;
        let parsed = match serde_json::from_str::<SpoolFile>(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(vec![FeedItem::Malformed {
                    source_item_id: stem,
                    discovered_at: modified,
                    reason: format!("unparseable spool file: {e}"),
                }]);
            }
        };
        let candidates = match parsed {
            SpoolFile::Many(many) => many,
            SpoolFile::One(one) => vec![one],
        };

        Ok(candidates
            .into_iter()
            .map(|c| {
                let source_item_id = c.source_item_id.unwrap_or_else(|| stem.clone());
                let discovered_at = c.discovered_at.unwrap_or(modified);
                let reference = c.candidate_reference.trim().to_string();
                if reference.is_empty() {
                    FeedItem::Malformed {
                        source_item_id,
                        discovered_at,
                        reason: "empty candidate_reference".to_string(),
                    }
                } else {
                    FeedItem::Candidate(Candidate {
                        source_item_id,
                        discovered_at,
                        candidate_reference: reference,
                        raw_payload: c.raw_payload,
                    })
                }
            })
            .collect())
    }
}

#[async_trait]
impl Feed for SpoolFeed {
    async fn fetch(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<FeedItem>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "spool directory missing");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(Error::Feed(format!("read {}: {e}", self.dir.display())));
            }
        };

        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_file(&path).await {
                Ok(found) => items.extend(found),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping spool file"),
            }
        }

        items.retain(|item| item.discovered_at() >= since);
        Ok(newest(items, limit))
    }
}

/// Sort oldest first and keep the newest `limit` items.
pub fn newest(mut items: Vec<FeedItem>, limit: usize) -> Vec<FeedItem> {
    items.sort_by_key(FeedItem::discovered_at);
    let excess = items.len().saturating_sub(limit);
    items.drain(..excess);
    items
}
