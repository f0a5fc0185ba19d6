use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{PandaError, Result};

/// Provenance of the metadata currently held by a [`Gallery`].
///
/// The three states gate which archivers may reuse a cached copy and which
/// must refetch; "metadata present" alone is not enough to decide that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataState {
    /// Loaded from the on-disk `api-metadata.json`, freshness unknown.
    Disk,
    /// Loaded from disk and verified newer than the gallery's update threshold.
    DiskUpToDate,
    /// Fetched from the API during this run.
    Online,
}

/// A single gallery being archived.
///
/// Identity (`id`, `token`, `dir`) is immutable; the file snapshot and the
/// metadata are populated lazily as element archivers need them.
#[derive(Debug)]
pub struct Gallery {
    id: u64,
    token: String,
    dir: PathBuf,
    files: Option<Vec<PathBuf>>,
    metadata: Option<Map<String, Value>>,
    metadata_state: Option<MetadataState>,
    expunged: bool,
    update_threshold: Option<DateTime<Utc>>,
}

impl Gallery {
    pub fn new(id: u64, token: impl Into<String>, dir: PathBuf) -> Self {
        Gallery {
            id,
            token: token.into(),
            dir,
            files: None,
            metadata: None,
            metadata_state: None,
            expunged: false,
            update_threshold: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads the snapshot of regular files in the gallery directory if it has
    /// not been loaded yet. The snapshot is not a live view; changes made
    /// outside the pipeline are tolerated as stale until the next gallery.
    pub fn ensure_files_loaded(&mut self) -> Result<()> {
        if self.files.is_some() {
            return Ok(());
        }

        let mut files = Vec::new();
        if self.dir.is_dir() {
            let entries = fs::read_dir(&self.dir)
                .map_err(|e| PandaError::failed(format!("could not retrieve directory's files: {e}")))?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
        }
        self.files = Some(files);

        Ok(())
    }

    pub fn files_loaded(&self) -> bool {
        self.files.is_some()
    }

    /// The current file snapshot. Empty until [`ensure_files_loaded`] ran.
    ///
    /// [`ensure_files_loaded`]: Gallery::ensure_files_loaded
    pub fn files(&self) -> &[PathBuf] {
        self.files.as_deref().unwrap_or(&[])
    }

    /// Records a file the pipeline itself just created inside the snapshot.
    pub fn record_file(&mut self, path: PathBuf) {
        if let Some(files) = self.files.as_mut() {
            files.push(path);
        }
    }

    pub fn contains_file(&self, filename: &str) -> bool {
        self.files()
            .iter()
            .any(|f| f.file_name().map(|n| n == filename).unwrap_or(false))
    }

    pub fn is_metadata_loaded(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata.as_ref()
    }

    pub fn metadata_state(&self) -> Option<MetadataState> {
        self.metadata_state
    }

    /// Sets the metadata together with its provenance and re-derives the
    /// expunged flag. The two are never set independently.
    pub fn set_metadata(&mut self, metadata: Map<String, Value>, state: MetadataState) {
        self.expunged = metadata
            .get("expunged")
            .map(json_bool)
            .unwrap_or(false);
        self.metadata = Some(metadata);
        self.metadata_state = Some(state);
    }

    /// Promotes already-loaded metadata to a fresher state.
    pub fn set_metadata_state(&mut self, state: MetadataState) {
        if self.metadata.is_some() {
            self.metadata_state = Some(state);
        }
    }

    pub fn is_expunged(&self) -> bool {
        self.expunged
    }

    pub fn update_threshold(&self) -> Option<DateTime<Utc>> {
        self.update_threshold
    }

    pub fn set_update_threshold(&mut self, threshold: DateTime<Utc>) {
        self.update_threshold = Some(threshold);
    }
}

/// A torrent entry as reported by the gdata API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTorrent {
    hash: String,
    tsize: u64,
    added: DateTime<Utc>,
}

impl ApiTorrent {
    pub fn new(hash: impl Into<String>, tsize: u64, added: DateTime<Utc>) -> Self {
        ApiTorrent {
            hash: hash.into(),
            tsize,
            added,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn tsize(&self) -> u64 {
        self.tsize
    }

    pub fn added(&self) -> DateTime<Utc> {
        self.added
    }

    /// Parses all torrent entries out of a gallery's metadata.
    pub fn parse_all(metadata: &Map<String, Value>) -> Result<Vec<ApiTorrent>> {
        let torrents = metadata
            .get("torrents")
            .and_then(Value::as_array)
            .ok_or_else(|| PandaError::parse("missing torrents array in metadata"))?;

        let mut result = Vec::with_capacity(torrents.len());
        for torrent in torrents {
            let torrent = torrent
                .as_object()
                .ok_or_else(|| PandaError::parse("torrent entry is not an object"))?;
            let hash = torrent
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| PandaError::parse("missing torrent hash"))?;
            let tsize = torrent
                .get("tsize")
                .and_then(json_u64)
                .ok_or_else(|| PandaError::parse("failed parsing torrent size"))?;
            let added = torrent
                .get("added")
                .and_then(json_u64)
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
                .ok_or_else(|| PandaError::parse("failed parsing torrent added date time"))?;

            result.push(ApiTorrent::new(hash, tsize, added));
        }

        Ok(result)
    }
}

/// Reads an unsigned integer that the API may encode as a number or a string.
pub fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Reads a boolean that the API may encode as a bool, number or string.
pub fn json_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Value::String(s) => s == "true" || s == "1",
        _ => false,
    }
}
