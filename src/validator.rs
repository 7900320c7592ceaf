use std::{collections::BTreeMap, fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::{now_unix_secs, write_atomic};

const MANIFEST_VERSION: u32 = 1;

/// Validators remembered from the last successful download of a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub last_fetched: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidatorManifest {
    version: u32,
    entries: BTreeMap<String, ValidatorEntry>,
}

/// Conditional request headers for a URL; both absent when it is unknown.
#[derive(Debug, Default)]
pub struct ConditionalHeaders {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Per-URL validator cache persisted as a single JSON file. Purely
/// advisory: a missing or deleted cache only costs bandwidth, never
/// correctness, so load failures degrade to an empty cache.
#[derive(Debug)]
pub struct ValidatorCache {
    path: PathBuf,
    entries: BTreeMap<String, ValidatorEntry>,
}

impl ValidatorCache {
    pub fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ValidatorManifest>(&bytes) {
                Ok(m) if m.version == MANIFEST_VERSION => m.entries,
                Ok(m) => {
                    warn!(path = %path.display(), version = m.version, "validator manifest version mismatch, starting empty");
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable validator manifest, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn conditional_headers(&self, url: &str) -> ConditionalHeaders {
        match self.entries.get(url) {
            Some(e) => ConditionalHeaders {
                if_none_match: e.etag.clone(),
                if_modified_since: e.last_modified.clone(),
            },
            None => ConditionalHeaders::default(),
        }
    }

    /// Upsert; fields not supplied keep their previous value. `last_fetched`
    /// is always bumped to now.
    pub fn update(
        &mut self,
        url: &str,
        etag: Option<String>,
        last_modified: Option<String>,
        digest: Option<String>,
    ) {
        let prev = self.entries.get(url);
        let entry = ValidatorEntry {
            etag: etag.or_else(|| prev.and_then(|p| p.etag.clone())),
            last_modified: last_modified.or_else(|| prev.and_then(|p| p.last_modified.clone())),
            last_fetched: now_unix_secs(),
            digest: digest.or_else(|| prev.and_then(|p| p.digest.clone())),
        };
        self.entries.insert(url.to_string(), entry);
    }

    /// Drop a URL entirely so the next fetch is unconditional.
    pub fn forget(&mut self, url: &str) {
        self.entries.remove(url);
    }

    pub fn expire(&mut self, max_age_days: i64) {
        let cutoff = now_unix_secs() - max_age_days * 24 * 60 * 60;
        self.entries.retain(|_, e| e.last_fetched >= cutoff);
    }

    pub fn entry(&self, url: &str) -> Option<&ValidatorEntry> {
        self.entries.get(url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let manifest = ValidatorManifest {
            version: MANIFEST_VERSION,
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("failed to serialize validator manifest")?;
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("failed to write validator manifest: {}", self.path.display()))
    }
}
