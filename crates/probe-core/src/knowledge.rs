//! Per-phase knowledge persistence.
//!
//! One pretty-printed JSON array per phase, `knowledge_base_phase_{n}.json`,
//! holding `{content, category}` records. Older files that stored bare
//! strings are upgraded on load.

use crate::types::{KnowledgeEntry, UNKNOWN_CATEGORY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("failed to write knowledge file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize knowledge: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;

/// On-disk shape of one entry, current or legacy.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Legacy(String),
    Record {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        category: Option<String>,
    },
    Other(serde_json::Value),
}

/// Durable knowledge, one file per phase.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    dir: PathBuf,
}

impl KnowledgeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, phase: u32) -> PathBuf {
        self.dir.join(format!("knowledge_base_phase_{phase}.json"))
    }

    /// Load a phase's entries.
    ///
    /// A missing file is an empty list. Unreadable or unparseable files are
    /// also treated as empty, with a warning.
    pub fn load(&self, phase: u32) -> Vec<KnowledgeEntry> {
        let path = self.path(phase);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read knowledge file");
                return Vec::new();
            }
        };

        let stored: Vec<StoredEntry> = match serde_json::from_str(&content) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "knowledge file is not valid, loading as empty");
                return Vec::new();
            }
        };

        let mut entries = Vec::with_capacity(stored.len());
        for item in stored {
            match item {
                StoredEntry::Legacy(content) => {
                    entries.push(KnowledgeEntry::new(content, UNKNOWN_CATEGORY, phase));
                }
                StoredEntry::Record {
                    content: Some(content),
                    category,
                } => {
                    let category = category.unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
                    entries.push(KnowledgeEntry::new(content, category, phase));
                }
                StoredEntry::Record { content: None, .. } | StoredEntry::Other(_) => {
                    debug!(phase, "dropping knowledge record without content");
                }
            }
        }
        entries
    }

    /// Replace a phase's file with `entries`.
    ///
    /// Written to a sibling temp file first and renamed into place.
    pub fn save(&self, phase: u32, entries: &[KnowledgeEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| KnowledgeError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path(phase);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(entries)?;

        std::fs::write(&tmp, body).map_err(|source| KnowledgeError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| KnowledgeError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(phase, count = entries.len(), path = %path.display(), "knowledge saved");
        Ok(())
    }

    /// Entries of every phase before `current_phase`, oldest first.
    pub fn load_previous(&self, current_phase: u32) -> Vec<KnowledgeEntry> {
        (1..current_phase).flat_map(|p| self.load(p)).collect()
    }

    /// All earlier phases' entries followed by the live list of the current one.
    pub fn aggregate(&self, current_phase: u32, current: &[KnowledgeEntry]) -> Vec<KnowledgeEntry> {
        let mut all = self.load_previous(current_phase);
        all.extend(current.iter().cloned());
        all
    }
}

/// Append candidates whose content is non-empty and not already present.
///
/// Returns how many entries were added. Existing entries are never touched.
pub fn merge_new<I>(existing: &mut Vec<KnowledgeEntry>, candidates: I) -> usize
where
    I: IntoIterator<Item = KnowledgeEntry>,
{
    let mut added = 0;
    for candidate in candidates {
        if candidate.content.trim().is_empty() {
            continue;
        }
        if existing.iter().any(|e| e.content == candidate.content) {
            continue;
        }
        existing.push(candidate);
        added += 1;
    }
    added
}
