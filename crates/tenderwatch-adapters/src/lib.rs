//! Batch source contracts + raw scraper-output ingestion.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tenderwatch_core::Record;
use tenderwatch_storage::NamePattern;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "tenderwatch-adapters";

const PROCESSED_DIR: &str = "processed";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Records of one run plus the inputs they were read from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreshBatch {
    pub records: Vec<Record>,
    pub inputs: Vec<PathBuf>,
}

impl FreshBatch {
    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            records,
            inputs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Produces the fresh batch of one source for the current run.
#[async_trait]
pub trait BatchSource: Send + Sync {
    fn source_name(&self) -> &str;

    /// Records in observation order. An empty batch is not an error.
    async fn fresh_batch(&self) -> Result<FreshBatch, AdapterError>;

    /// Called once the merge result of a batch is stored, so the same inputs are not
    /// replayed by the next run. Returns how many inputs were retired.
    async fn mark_consumed(&self, _inputs: &[PathBuf]) -> Result<usize, AdapterError> {
        Ok(0)
    }
}

/// Raw file body: either a bare array or the scrapers' result envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPayload {
    Records(Vec<JsonValue>),
    Envelope(RawEnvelope),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    crawler_id: Option<String>,
    #[serde(default)]
    run_at: Option<String>,
    #[serde(default)]
    total_records: Option<usize>,
    #[serde(default)]
    data: Option<RawData>,
}

/// Flat list, or category → list as the PPP scraper emits.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawData {
    List(Vec<JsonValue>),
    Grouped(serde_json::Map<String, JsonValue>),
}

#[derive(Debug, Clone)]
pub struct RawBatch {
    pub path: PathBuf,
    pub crawler_id: Option<String>,
    pub run_at: Option<String>,
    pub records: Vec<Record>,
    /// Array entries that were not JSON objects.
    pub dropped_entries: usize,
}

pub fn parse_raw_batch(path: impl AsRef<Path>, bytes: &[u8]) -> Result<RawBatch, AdapterError> {
    let path = path.as_ref();
    let payload: RawPayload = serde_json::from_slice(bytes).map_err(|source| AdapterError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let (crawler_id, run_at, declared_total, values) = match payload {
        RawPayload::Records(values) => (None, None, None, values),
        RawPayload::Envelope(envelope) => {
            let values = match envelope.data {
                None => Vec::new(),
                Some(RawData::List(values)) => values,
                Some(RawData::Grouped(groups)) => groups
                    .into_iter()
                    .filter_map(|(_, group)| match group {
                        JsonValue::Array(values) => Some(values),
                        _ => None,
                    })
                    .flatten()
                    .collect(),
            };
            (envelope.crawler_id, envelope.run_at, envelope.total_records, values)
        }
    };

    let total = values.len();
    let records: Vec<Record> = values.into_iter().filter_map(Record::from_value).collect();
    let dropped_entries = total - records.len();

    if let Some(declared) = declared_total {
        if declared != total {
            warn!(path = %path.display(), declared, found = total, "raw batch record count differs from totalRecords");
        }
    }

    Ok(RawBatch {
        path: path.to_path_buf(),
        crawler_id,
        run_at,
        records,
        dropped_entries,
    })
}

pub fn load_raw_batch(path: impl AsRef<Path>) -> Result<RawBatch, AdapterError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_raw_batch(path, &bytes)
}

/// Reads every raw file of one source from a local scraper output directory.
///
/// Consumed files are moved into `<dir>/processed/`, which is never listed.
#[derive(Debug, Clone)]
pub struct RawFileBatchSource {
    source: String,
    dir: PathBuf,
    pattern: NamePattern,
}

impl RawFileBatchSource {
    pub fn new(source: impl Into<String>, dir: impl Into<PathBuf>, pattern: impl AsRef<str>) -> Self {
        Self {
            source: source.into(),
            dir: dir.into(),
            pattern: NamePattern::new(pattern),
        }
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.dir.join(PROCESSED_DIR)
    }

    /// Matching raw files in name order; merged outputs and hidden files are never raw input.
    pub fn raw_files(&self) -> Result<Vec<PathBuf>, AdapterError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AdapterError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AdapterError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.contains("_merged_") || !self.pattern.matches(&name) {
                continue;
            }
            if entry.path().is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl BatchSource for RawFileBatchSource {
    fn source_name(&self) -> &str {
        &self.source
    }

    async fn fresh_batch(&self) -> Result<FreshBatch, AdapterError> {
        let inputs = self.raw_files()?;
        let mut records = Vec::new();
        for path in &inputs {
            let batch = load_raw_batch(&path)?;
            debug!(
                source = %self.source,
                path = %path.display(),
                crawler_id = batch.crawler_id.as_deref().unwrap_or("-"),
                records = batch.records.len(),
                "loaded raw batch"
            );
            if batch.dropped_entries > 0 {
                warn!(source = %self.source, path = %path.display(), dropped = batch.dropped_entries, "dropped non-object raw entries");
            }
            records.extend(batch.records);
        }
        Ok(FreshBatch { records, inputs })
    }

    async fn mark_consumed(&self, inputs: &[PathBuf]) -> Result<usize, AdapterError> {
        if inputs.is_empty() {
            return Ok(0);
        }
        let processed = self.processed_dir();
        fs::create_dir_all(&processed).map_err(|source| AdapterError::Io {
            path: processed.clone(),
            source,
        })?;

        let mut moved = 0;
        for path in inputs {
            let Some(name) = path.file_name() else {
                continue;
            };
            match fs::rename(path, processed.join(name)) {
                Ok(()) => moved += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(source = %self.source, path = %path.display(), "raw file already consumed");
                }
                Err(source) => {
                    return Err(AdapterError::Io {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(moved)
    }
}

/// A batch already in memory, for callers that scrape in-process.
#[derive(Debug, Clone)]
pub struct StaticBatchSource {
    source: String,
    records: Vec<Record>,
}

impl StaticBatchSource {
    pub fn new(source: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            source: source.into(),
            records,
        }
    }
}

#[async_trait]
impl BatchSource for StaticBatchSource {
    fn source_name(&self) -> &str {
        &self.source
    }

    async fn fresh_batch(&self) -> Result<FreshBatch, AdapterError> {
        Ok(FreshBatch::from_records(self.records.clone()))
    }
}
