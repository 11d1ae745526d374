//! Record model, Strategy C version tracking and the merged dataset format for tenderwatch.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "tenderwatch-core";

/// Fields that change on every scrape without the tender itself changing.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "scrapedAt",
    "scraped_at",
    "scrapedTime",
    "scrape_time",
    "scraped_at_ts",
    "lastUpdateTime",
    "updatedAt",
    "updated_at",
];

/// Candidate fields for a snapshot's capture time, in priority order.
pub const DEFAULT_TIMESTAMP_FIELDS: &[&str] = &[
    "scrapedAt",
    "scraped_at",
    "scrapedTime",
    "scrape_time",
    "createdAt",
    "created_at",
];

pub const DEFAULT_IDENTITY_FIELD: &str = "tenderId";

/// Key under which a snapshot's capture time is persisted next to the record fields.
pub const CAPTURED_AT_KEY: &str = "_capturedAt";

const MERGED_MARKER: &str = "_merged_";
const MERGED_EXTENSION: &str = ".json";
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const IDENTITY_SEPARATOR: &str = "::";

/// One scraped tender/announcement as captured. Field order carries no meaning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Accepts JSON objects only; anything else is not a record.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A record with its volatile fields removed. Only ever used for equality.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord(Map<String, Value>);

impl NormalizedRecord {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_record(self) -> Record {
        Record(self.0)
    }
}

/// Strips volatile fields before content comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalizer {
    volatile_fields: BTreeSet<String>,
    ignore_private_fields: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_FIELDS.iter().copied(), true)
    }
}

impl Normalizer {
    /// `ignore_private_fields` additionally treats every `_`-prefixed key as volatile.
    pub fn new<I, S>(volatile_fields: I, ignore_private_fields: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile_fields: volatile_fields.into_iter().map(Into::into).collect(),
            ignore_private_fields,
        }
    }

    pub fn volatile_fields(&self) -> impl Iterator<Item = &str> {
        self.volatile_fields.iter().map(String::as_str)
    }

    pub fn is_volatile(&self, field: &str) -> bool {
        self.volatile_fields.contains(field) || (self.ignore_private_fields && field.starts_with('_'))
    }

    pub fn normalize(&self, record: &Record) -> NormalizedRecord {
        NormalizedRecord(
            record
                .0
                .iter()
                .filter(|(key, _)| !self.is_volatile(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    /// Content equality ignoring volatile fields, without materializing either side.
    pub fn same_content(&self, a: &Record, b: &Record) -> bool {
        let mut left = a.0.iter().filter(|(key, _)| !self.is_volatile(key));
        let left_len = left.clone().count();
        let right_len = b.0.keys().filter(|key| !self.is_volatile(key)).count();
        left_len == right_len && left.all(|(key, value)| b.0.get(key) == Some(value))
    }
}

/// Which field (or ordered field combination) groups observations of one real-world tender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPolicy {
    fields: Vec<String>,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self::single(DEFAULT_IDENTITY_FIELD)
    }
}

impl IdentityPolicy {
    pub fn single(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
        }
    }

    /// Falls back to the default identity field when given no fields.
    pub fn composite<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            Self::default()
        } else {
            Self { fields }
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// `None` when any identity part is missing, null, blank or non-scalar.
    pub fn identity_of(&self, record: &Record) -> Option<String> {
        let mut parts = self
            .fields
            .iter()
            .map(|field| record.get(field).and_then(identity_part))
            .collect::<Option<Vec<_>>>()?;
        if parts.len() == 1 {
            return parts.pop();
        }
        // Escaped so that a separator inside a part cannot shift the boundary between parts.
        let escaped: Vec<String> = parts.iter().map(|part| escape_identity_part(part)).collect();
        Some(escaped.join(IDENTITY_SEPARATOR))
    }
}

fn escape_identity_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        if matches!(ch, '\\' | ':') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn identity_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Identity, normalization and capture-time rules for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingPolicy {
    pub identity: IdentityPolicy,
    pub normalizer: Normalizer,
    pub timestamp_fields: Vec<String>,
}

impl Default for TrackingPolicy {
    fn default() -> Self {
        Self {
            identity: IdentityPolicy::default(),
            normalizer: Normalizer::default(),
            timestamp_fields: DEFAULT_TIMESTAMP_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl TrackingPolicy {
    /// First parseable timestamp field of the record, else `fallback`.
    pub fn capture_time(&self, record: &Record, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp_fields
            .iter()
            .filter_map(|field| record.get(field).and_then(Value::as_str))
            .find_map(parse_timestamp)
            .unwrap_or(fallback)
    }
}

/// RFC 3339, or naive ISO 8601 read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A record as first observed, plus when it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub record: Record,
    #[serde(rename = "_capturedAt")]
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(mut record: Record, captured_at: DateTime<Utc>) -> Self {
        record.remove(CAPTURED_AT_KEY);
        Self {
            record,
            captured_at,
        }
    }
}

/// Content-distinct history of one identity, oldest first.
///
/// Adjacent snapshots never share normalized content, and the history is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    identity: String,
    snapshots: Vec<Snapshot>,
}

impl VersionedRecord {
    pub fn new(identity: impl Into<String>, first: Snapshot) -> Self {
        Self {
            identity: identity.into(),
            snapshots: vec![first],
        }
    }

    /// Rebuilds a persisted history; `None` for an empty one.
    pub fn from_snapshots(identity: impl Into<String>, snapshots: Vec<Snapshot>) -> Option<Self> {
        if snapshots.is_empty() {
            return None;
        }
        Some(Self {
            identity: identity.into(),
            snapshots,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Inserted,
    Appended,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackCounts {
    pub inserted: usize,
    pub appended: usize,
    pub discarded: usize,
    /// Records without a usable identity.
    pub skipped: usize,
}

impl TrackCounts {
    pub fn record(&mut self, observation: Observation) {
        match observation {
            Observation::Inserted => self.inserted += 1,
            Observation::Appended => self.appended += 1,
            Observation::Discarded => self.discarded += 1,
        }
    }

    /// Number of observations that produced a new snapshot.
    pub fn changed(&self) -> usize {
        self.inserted + self.appended
    }
}

/// Strategy C state machine over a set of per-identity histories.
#[derive(Debug)]
pub struct VersionTracker<'a> {
    normalizer: &'a Normalizer,
    histories: BTreeMap<String, VersionedRecord>,
    counts: TrackCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub histories: BTreeMap<String, VersionedRecord>,
    pub counts: TrackCounts,
}

impl<'a> VersionTracker<'a> {
    pub fn new(normalizer: &'a Normalizer, prior: BTreeMap<String, VersionedRecord>) -> Self {
        Self {
            normalizer,
            histories: prior,
            counts: TrackCounts::default(),
        }
    }

    /// Compares against the most recent accepted snapshot of `identity` only.
    ///
    /// An observation captured before that snapshot is a replay of older input and is discarded.
    pub fn observe(&mut self, identity: &str, record: Record, captured_at: DateTime<Utc>) -> Observation {
        let observation = match self.histories.get_mut(identity) {
            Some(history) => {
                let latest = history.latest();
                let stale = latest.is_some_and(|latest| captured_at < latest.captured_at);
                let unchanged = latest.is_some_and(|latest| self.normalizer.same_content(&latest.record, &record));
                if stale {
                    debug!(identity, %captured_at, "observation older than latest snapshot; discarded");
                    Observation::Discarded
                } else if unchanged {
                    Observation::Discarded
                } else {
                    history.snapshots.push(Snapshot::new(record, captured_at));
                    Observation::Appended
                }
            }
            None => {
                let history = VersionedRecord::new(identity, Snapshot::new(record, captured_at));
                self.histories.insert(identity.to_string(), history);
                Observation::Inserted
            }
        };
        self.counts.record(observation);
        observation
    }

    pub fn skip_unidentified(&mut self) {
        self.counts.skipped += 1;
    }

    pub fn counts(&self) -> TrackCounts {
        self.counts
    }

    pub fn histories(&self) -> &BTreeMap<String, VersionedRecord> {
        &self.histories
    }

    pub fn finish(self) -> TrackOutcome {
        TrackOutcome {
            histories: self.histories,
            counts: self.counts,
        }
    }
}

/// Observes every record of `batch` in order against `prior`.
///
/// `observed_at` stands in as capture time for records without a parseable timestamp.
pub fn keep_only_changed_versions<I>(
    policy: &TrackingPolicy,
    batch: I,
    prior: BTreeMap<String, VersionedRecord>,
    observed_at: DateTime<Utc>,
) -> TrackOutcome
where
    I: IntoIterator<Item = Record>,
{
    let mut tracker = VersionTracker::new(&policy.normalizer, prior);
    for record in batch {
        let Some(identity) = policy.identity.identity_of(&record) else {
            debug!(identity_fields = ?policy.identity.fields(), "skipping record without identity");
            tracker.skip_unidentified();
            continue;
        };
        let captured_at = policy.capture_time(&record, observed_at);
        tracker.observe(&identity, record, captured_at);
    }
    tracker.finish()
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("malformed merged dataset: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("encoding merged dataset: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("dataset belongs to source `{found}`, expected `{expected}`")]
    SourceMismatch { expected: String, found: String },
    #[error("identity `{identity}` has an empty history")]
    EmptyHistory { identity: String },
    #[error("declared {field} is {declared} but dataset holds {actual}")]
    TotalsMismatch {
        field: &'static str,
        declared: usize,
        actual: usize,
    },
}

/// All tracked histories of one source as of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDataset {
    source: String,
    generated_at: DateTime<Utc>,
    identity_fields: Vec<String>,
    records: BTreeMap<String, VersionedRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MergedDatasetOut<'a> {
    source: &'a str,
    generated_at: DateTime<Utc>,
    identity_fields: &'a [String],
    total_identities: usize,
    total_snapshots: usize,
    records: BTreeMap<&'a str, &'a [Snapshot]>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergedDatasetIn {
    source: String,
    generated_at: DateTime<Utc>,
    #[serde(default)]
    identity_fields: Vec<String>,
    #[serde(default)]
    total_identities: Option<usize>,
    #[serde(default)]
    total_snapshots: Option<usize>,
    records: BTreeMap<String, Vec<Snapshot>>,
}

impl MergedDataset {
    pub fn new(
        source: impl Into<String>,
        generated_at: DateTime<Utc>,
        identity_fields: Vec<String>,
        records: BTreeMap<String, VersionedRecord>,
    ) -> Self {
        Self {
            source: source.into(),
            generated_at,
            identity_fields,
            records,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn identity_fields(&self) -> &[String] {
        &self.identity_fields
    }

    pub fn records(&self) -> &BTreeMap<String, VersionedRecord> {
        &self.records
    }

    pub fn get(&self, identity: &str) -> Option<&VersionedRecord> {
        self.records.get(identity)
    }

    pub fn identity_count(&self) -> usize {
        self.records.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.records.values().map(VersionedRecord::len).sum()
    }

    pub fn file_name(&self) -> String {
        merged_file_name(&self.source, self.generated_at)
    }

    pub fn into_histories(self) -> BTreeMap<String, VersionedRecord> {
        self.records
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, DatasetError> {
        let out = MergedDatasetOut {
            source: &self.source,
            generated_at: self.generated_at,
            identity_fields: &self.identity_fields,
            total_identities: self.identity_count(),
            total_snapshots: self.snapshot_count(),
            records: self
                .records
                .iter()
                .map(|(identity, history)| (identity.as_str(), history.snapshots()))
                .collect(),
        };
        serde_json::to_vec_pretty(&out).map_err(DatasetError::Encode)
    }

    /// Parses and validates a persisted dataset of `expected_source`.
    pub fn from_json_slice(expected_source: &str, bytes: &[u8]) -> Result<Self, DatasetError> {
        let wire: MergedDatasetIn = serde_json::from_slice(bytes).map_err(DatasetError::Decode)?;
        if wire.source != expected_source {
            return Err(DatasetError::SourceMismatch {
                expected: expected_source.to_string(),
                found: wire.source,
            });
        }

        let mut total_snapshots = 0usize;
        let mut records = BTreeMap::new();
        for (identity, snapshots) in wire.records {
            total_snapshots += snapshots.len();
            let history = VersionedRecord::from_snapshots(identity.clone(), snapshots)
                .ok_or_else(|| DatasetError::EmptyHistory {
                    identity: identity.clone(),
                })?;
            records.insert(identity, history);
        }

        check_total("totalIdentities", wire.total_identities, records.len())?;
        check_total("totalSnapshots", wire.total_snapshots, total_snapshots)?;

        Ok(Self {
            source: wire.source,
            generated_at: wire.generated_at,
            identity_fields: wire.identity_fields,
            records,
        })
    }
}

fn check_total(field: &'static str, declared: Option<usize>, actual: usize) -> Result<(), DatasetError> {
    match declared {
        Some(declared) if declared != actual => Err(DatasetError::TotalsMismatch {
            field,
            declared,
            actual,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub dataset: MergedDataset,
    pub counts: TrackCounts,
}

/// Folds `fresh_batch` into the previous dataset's histories.
///
/// Pure in its inputs: identities from `previous` are always carried over, and
/// `generated_at` is the only clock this reads.
pub fn merge<I>(
    source: &str,
    policy: &TrackingPolicy,
    fresh_batch: I,
    previous: Option<MergedDataset>,
    generated_at: DateTime<Utc>,
) -> MergeOutcome
where
    I: IntoIterator<Item = Record>,
{
    let prior = previous.map(MergedDataset::into_histories).unwrap_or_default();
    let outcome = keep_only_changed_versions(policy, fresh_batch, prior, generated_at);
    MergeOutcome {
        dataset: MergedDataset::new(
            source,
            generated_at,
            policy.identity.fields().to_vec(),
            outcome.histories,
        ),
        counts: outcome.counts,
    }
}

/// `<source>_merged_<YYYYmmdd_HHMMSS>.json`
pub fn merged_file_name(source: &str, generated_at: DateTime<Utc>) -> String {
    format!(
        "{source}{MERGED_MARKER}{}{MERGED_EXTENSION}",
        generated_at.format(FILE_STAMP_FORMAT)
    )
}

/// Glob matching every merged file of `source` (and possibly look-alikes; confirm with
/// [`parse_merged_file_name`]).
pub fn merged_file_glob(source: &str) -> String {
    format!("{source}{MERGED_MARKER}*{MERGED_EXTENSION}")
}

/// Splits a merged file name into its source and generation time.
pub fn parse_merged_file_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = name.strip_suffix(MERGED_EXTENSION)?;
    let marker = stem.rfind(MERGED_MARKER)?;
    let source = &stem[..marker];
    let stamp = &stem[marker + MERGED_MARKER.len()..];
    if source.is_empty() {
        return None;
    }
    let generated_at = NaiveDateTime::parse_from_str(stamp, FILE_STAMP_FORMAT).ok()?.and_utc();
    Some((source.to_string(), generated_at))
}

pub fn is_merged_file_of(name: &str, source: &str) -> bool {
    matches!(parse_merged_file_name(name), Some((found, _)) if found == source)
}
