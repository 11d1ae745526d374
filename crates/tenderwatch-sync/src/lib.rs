//! Per-source merge, archive and purge orchestration for tenderwatch runs.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tenderwatch_adapters::{AdapterError, BatchSource, RawFileBatchSource};
use tenderwatch_core::{
    is_merged_file_of, merge, merged_file_glob, DatasetError, IdentityPolicy, MergeOutcome, MergedDataset,
    Normalizer, Record, TrackCounts, TrackingPolicy, DEFAULT_IDENTITY_FIELD, DEFAULT_VOLATILE_FIELDS,
};
use tenderwatch_storage::{
    DriveConfig, DriveStore, FileRef, LocalFolderStore, NamePattern, RemoteStorage, StorageError,
};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tenderwatch-sync";

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub raw_file_pattern: String,
    #[serde(default = "default_identity_fields")]
    pub identity_fields: Vec<String>,
    /// Replaces the default volatile field set when present.
    #[serde(default)]
    pub volatile_fields: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub ignore_private_fields: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_identity_fields() -> Vec<String> {
    vec![DEFAULT_IDENTITY_FIELD.to_string()]
}

impl SourceConfig {
    pub fn tracking_policy(&self) -> TrackingPolicy {
        let normalizer = match &self.volatile_fields {
            Some(fields) => Normalizer::new(fields.iter().cloned(), self.ignore_private_fields),
            None => Normalizer::new(DEFAULT_VOLATILE_FIELDS.iter().copied(), self.ignore_private_fields),
        };
        TrackingPolicy {
            identity: IdentityPolicy::composite(self.identity_fields.iter().cloned()),
            normalizer,
            ..TrackingPolicy::default()
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Source names end up in file names, so they must be plain and unique.
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.name.as_str();
            if name.trim().is_empty() {
                bail!("source with empty name");
            }
            if name.contains(['/', '\\', '*', '?']) || name.contains("_merged_") {
                bail!("source name `{name}` may not contain path separators, wildcards or `_merged_`");
            }
            if !seen.insert(name) {
                bail!("duplicate source `{name}`");
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local { root: PathBuf },
    Drive { access_token: Option<String> },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub raw_dir: PathBuf,
    pub storage: StorageBackend,
    pub active_folder: String,
    pub archive_folder: String,
    pub retention_days: i64,
    pub cleanup_weekday: Weekday,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let storage = match std::env::var("TENDERWATCH_STORAGE").as_deref() {
            Ok("drive") => StorageBackend::Drive {
                access_token: std::env::var("DRIVE_ACCESS_TOKEN").ok(),
            },
            _ => StorageBackend::Local {
                root: std::env::var("TENDERWATCH_LOCAL_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./storage")),
            },
        };

        Self {
            workspace_root: std::env::var("TENDERWATCH_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            raw_dir: std::env::var("TENDERWATCH_RAW_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./output")),
            storage,
            active_folder: std::env::var("TENDERWATCH_ACTIVE_FOLDER")
                .or_else(|_| std::env::var("GOOGLE_DRIVE_FOLDER_ID"))
                .unwrap_or_else(|_| "merged".to_string()),
            archive_folder: std::env::var("TENDERWATCH_ARCHIVE_FOLDER")
                .unwrap_or_else(|_| "_archive".to_string()),
            retention_days: std::env::var("TENDERWATCH_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            cleanup_weekday: std::env::var("TENDERWATCH_CLEANUP_WEEKDAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Weekday::Sun),
            scheduler_enabled: std::env::var("TENDERWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("TENDERWATCH_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("TENDERWATCH_USER_AGENT")
                .unwrap_or_else(|_| "tenderwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("TENDERWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

pub fn build_storage(config: &SyncConfig) -> Result<Arc<dyn RemoteStorage>> {
    match &config.storage {
        StorageBackend::Local { root } => Ok(Arc::new(LocalFolderStore::new(root.clone()))),
        StorageBackend::Drive { access_token } => {
            let token = access_token
                .clone()
                .filter(|t| !t.trim().is_empty())
                .context("DRIVE_ACCESS_TOKEN is required for drive storage")?;
            let mut drive = DriveConfig::new(token);
            drive.timeout = Duration::from_secs(config.http_timeout_secs);
            drive.user_agent = Some(config.user_agent.clone());
            Ok(Arc::new(DriveStore::new(drive)?))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ListActive,
    DownloadPrevious,
    ParsePrevious,
    LoadBatch,
    Encode,
    Upload,
    Archive,
    Purge,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListActive => "list-active",
            Self::DownloadPrevious => "download-previous",
            Self::ParsePrevious => "parse-previous",
            Self::LoadBatch => "load-batch",
            Self::Encode => "encode",
            Self::Upload => "upload",
            Self::Archive => "archive",
            Self::Purge => "purge",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("[{source_name}] storage unavailable during {stage}: {cause}")]
    StorageUnavailable {
        source_name: String,
        stage: Stage,
        #[source]
        cause: StorageError,
    },
    #[error("[{source_name}] previous merged dataset {file} is corrupt: {cause}")]
    CorruptPreviousDataset {
        source_name: String,
        file: String,
        #[source]
        cause: DatasetError,
    },
    #[error("[{source_name}] fresh batch unavailable: {cause}")]
    BatchUnavailable {
        source_name: String,
        #[source]
        cause: AdapterError,
    },
    #[error("[{source_name}] encoding merged dataset: {cause}")]
    EncodeDataset {
        source_name: String,
        #[source]
        cause: DatasetError,
    },
    #[error("[{source_name}] new dataset is stored but {file} was not archived: {cause}")]
    PartialArchiveFailure {
        source_name: String,
        file: String,
        #[source]
        cause: StorageError,
    },
    #[error("archive listing unavailable: {cause}")]
    PurgeUnavailable {
        #[source]
        cause: StorageError,
    },
}

impl SyncError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::StorageUnavailable { stage, .. } => *stage,
            Self::CorruptPreviousDataset { .. } => Stage::ParsePrevious,
            Self::BatchUnavailable { .. } => Stage::LoadBatch,
            Self::EncodeDataset { .. } => Stage::Encode,
            Self::PartialArchiveFailure { .. } => Stage::Archive,
            Self::PurgeUnavailable { .. } => Stage::Purge,
        }
    }

    fn storage(source_name: &str, stage: Stage, cause: StorageError) -> Self {
        Self::StorageUnavailable {
            source_name: source_name.to_string(),
            stage,
            cause,
        }
    }
}

/// Merged files of one source currently in active storage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActiveFiles {
    /// Most recently modified; the authoritative history.
    pub previous: Option<FileRef>,
    /// Older leftovers, e.g. from a run interrupted between upload and archive.
    pub stale: Vec<FileRef>,
}

/// Picks the newest merged file of `source` by modification time, then name.
pub fn select_previous(files: Vec<FileRef>, source: &str) -> ActiveFiles {
    let mut merged: Vec<FileRef> = files
        .into_iter()
        .filter(|f| is_merged_file_of(&f.name, source))
        .collect();
    merged.sort_by(|a, b| {
        a.modified_time
            .cmp(&b.modified_time)
            .then_with(|| a.name.cmp(&b.name))
    });
    let previous = merged.pop();
    ActiveFiles {
        previous,
        stale: merged,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviousDataset {
    pub file: FileRef,
    pub dataset: MergedDataset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedDataset {
    pub file: FileRef,
    pub sha256: String,
    pub bytes: usize,
}

/// Reads the previous merged dataset of a source and publishes its successor.
pub struct MergeEngine {
    storage: Arc<dyn RemoteStorage>,
    active_folder: String,
}

impl MergeEngine {
    pub fn new(storage: Arc<dyn RemoteStorage>, active_folder: impl Into<String>) -> Self {
        Self {
            storage,
            active_folder: active_folder.into(),
        }
    }

    pub async fn active_files(&self, source: &str) -> Result<ActiveFiles, SyncError> {
        let files = self
            .storage
            .list_files(&self.active_folder, &NamePattern::new(merged_file_glob(source)))
            .await
            .map_err(|cause| SyncError::storage(source, Stage::ListActive, cause))?;
        Ok(select_previous(files, source))
    }

    /// A parse failure is fatal; it never degrades to "no previous dataset".
    pub async fn read_dataset(&self, source: &str, file: &FileRef) -> Result<MergedDataset, SyncError> {
        let bytes = self
            .storage
            .download_file(file)
            .await
            .map_err(|cause| SyncError::storage(source, Stage::DownloadPrevious, cause))?;
        MergedDataset::from_json_slice(source, &bytes).map_err(|cause| SyncError::CorruptPreviousDataset {
            source_name: source.to_string(),
            file: file.name.clone(),
            cause,
        })
    }

    /// `Ok(None)` only on a source's first run.
    pub async fn load_previous(&self, source: &str) -> Result<Option<PreviousDataset>, SyncError> {
        let Some(file) = self.active_files(source).await?.previous else {
            return Ok(None);
        };
        let dataset = self.read_dataset(source, &file).await?;
        Ok(Some(PreviousDataset { file, dataset }))
    }

    pub fn merge(
        &self,
        source: &str,
        policy: &TrackingPolicy,
        fresh_batch: Vec<Record>,
        previous: Option<MergedDataset>,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        merge(source, policy, fresh_batch, previous, now)
    }

    pub async fn publish(&self, dataset: &MergedDataset) -> Result<PublishedDataset, SyncError> {
        let bytes = dataset.to_json_bytes().map_err(|cause| SyncError::EncodeDataset {
            source_name: dataset.source().to_string(),
            cause,
        })?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let file = self
            .storage
            .upload_file(&self.active_folder, &dataset.file_name(), &bytes)
            .await
            .map_err(|cause| SyncError::storage(dataset.source(), Stage::Upload, cause))?;
        Ok(PublishedDataset {
            file,
            sha256,
            bytes: bytes.len(),
        })
    }
}

/// A superseded merged file sitting in the archive folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveEntry {
    pub file: FileRef,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveEntry {
    /// The archive backends stamp a file's modification time when it is moved in.
    pub fn from_archived(file: FileRef) -> Self {
        let archived_at = file.modified_time;
        Self { file, archived_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.archived_at + retention < now
    }
}

#[derive(Debug, Default)]
pub struct ArchiveOutcome {
    pub archived: Vec<ArchiveEntry>,
    pub failures: Vec<SyncError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeOutcome {
    pub deleted: Vec<String>,
    pub retained: usize,
    pub failed: Vec<String>,
}

pub fn is_cleanup_day(now: DateTime<Utc>, cleanup_weekday: Weekday) -> bool {
    now.weekday() == cleanup_weekday
}

/// Moves superseded merged files into cold storage and purges them after retention.
pub struct ArchiveManager {
    storage: Arc<dyn RemoteStorage>,
    archive_folder: String,
    retention: chrono::Duration,
}

impl ArchiveManager {
    pub fn new(storage: Arc<dyn RemoteStorage>, archive_folder: impl Into<String>, retention_days: i64) -> Self {
        Self {
            storage,
            archive_folder: archive_folder.into(),
            retention: chrono::Duration::days(retention_days.max(0)),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    /// Archives every file in `superseded`; one failed move does not stop the rest.
    pub async fn archive_superseded(&self, source: &str, superseded: &[FileRef]) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::default();
        for file in superseded {
            match self.storage.move_file(file, &self.archive_folder).await {
                Ok(moved) => {
                    info!(source, file = %moved.name, "archived superseded merged file");
                    outcome.archived.push(ArchiveEntry::from_archived(moved));
                }
                Err(cause) => {
                    let err = SyncError::PartialArchiveFailure {
                        source_name: source.to_string(),
                        file: file.name.clone(),
                        cause,
                    };
                    warn!(source, error = %err, "partial archive failure; file stays active until the next run");
                    outcome.failures.push(err);
                }
            }
        }
        outcome
    }

    pub async fn list_archive(&self) -> Result<Vec<ArchiveEntry>, SyncError> {
        let files = self
            .storage
            .list_files(&self.archive_folder, &NamePattern::new("*_merged_*.json"))
            .await
            .map_err(|cause| SyncError::PurgeUnavailable { cause })?;
        Ok(files.into_iter().map(ArchiveEntry::from_archived).collect())
    }

    /// Deletes archive entries older than the retention window. Safe to re-run.
    pub async fn run_weekly_purge(&self, now: DateTime<Utc>) -> Result<PurgeOutcome, SyncError> {
        let mut outcome = PurgeOutcome::default();
        for entry in self.list_archive().await? {
            if !entry.is_expired(now, self.retention) {
                outcome.retained += 1;
                continue;
            }
            match self.storage.delete_file(&entry.file).await {
                Ok(()) => {
                    info!(file = %entry.file.name, archived_at = %entry.archived_at, "purged expired archive entry");
                    outcome.deleted.push(entry.file.name);
                }
                Err(err) => {
                    error!(file = %entry.file.name, error = %err, "failed to purge archive entry");
                    outcome.failed.push(format!("{}: {err}", entry.file.name));
                }
            }
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Only on the configured cleanup weekday.
    Scheduled,
    Force,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SourceOutcome {
    Merged,
    Failed { stage: Stage, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadStatus {
    NotAttempted,
    Uploaded,
    SkippedUnchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ArchiveStatus {
    NotAttempted,
    NothingToArchive,
    Completed,
    PartialFailure { errors: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PurgeStatus {
    NotScheduled,
    Completed(PurgeOutcome),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRunReport {
    pub source: String,
    pub outcome: SourceOutcome,
    pub counts: TrackCounts,
    pub identities: usize,
    pub snapshots: usize,
    pub previous_file: Option<String>,
    pub upload: UploadStatus,
    pub uploaded_file: Option<String>,
    pub uploaded_sha256: Option<String>,
    pub archived_files: Vec<String>,
    pub archive: ArchiveStatus,
    /// Raw inputs retired after this run's result was stored.
    pub consumed_inputs: usize,
}

impl SourceRunReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            outcome: SourceOutcome::Merged,
            counts: TrackCounts::default(),
            identities: 0,
            snapshots: 0,
            previous_file: None,
            upload: UploadStatus::NotAttempted,
            uploaded_file: None,
            uploaded_sha256: None,
            archived_files: Vec::new(),
            archive: ArchiveStatus::NotAttempted,
            consumed_inputs: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunReport>,
    pub purge: PurgeStatus,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.is_failed()).count()
    }

    pub fn source(&self, name: &str) -> Option<&SourceRunReport> {
        self.sources.iter().find(|s| s.source == name)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    merge: MergeEngine,
    archive: ArchiveManager,
    batch_sources: BTreeMap<String, Arc<dyn BatchSource>>,
    run_guard: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry, storage: Arc<dyn RemoteStorage>) -> Self {
        let merge = MergeEngine::new(storage.clone(), config.active_folder.clone());
        let archive = ArchiveManager::new(storage, config.archive_folder.clone(), config.retention_days);
        let batch_sources = registry
            .enabled()
            .map(|source| {
                let batch: Arc<dyn BatchSource> = Arc::new(RawFileBatchSource::new(
                    source.name.clone(),
                    config.raw_dir.clone(),
                    &source.raw_file_pattern,
                ));
                (source.name.clone(), batch)
            })
            .collect();
        Self {
            config,
            registry,
            merge,
            archive,
            batch_sources,
            run_guard: Mutex::new(()),
        }
    }

    /// Replaces the raw-file batch source of `batch.source_name()`.
    pub fn with_batch_source(mut self, batch: Arc<dyn BatchSource>) -> Self {
        self.batch_sources.insert(batch.source_name().to_string(), batch);
        self
    }

    pub fn archive_manager(&self) -> &ArchiveManager {
        &self.archive
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    pub async fn run_once(&self, purge: PurgeMode) -> Result<SyncRunSummary> {
        self.run_once_at(Utc::now(), purge).await
    }

    /// One full run with `now` as the generation and purge clock. Waits for a run in progress.
    pub async fn run_once_at(&self, now: DateTime<Utc>, purge: PurgeMode) -> Result<SyncRunSummary> {
        let _guard = self.run_guard.lock().await;
        self.run_locked(now, purge).await
    }

    /// Like [`Self::run_once_at`], but returns `None` instead of waiting when a run is in progress.
    pub async fn try_run_once_at(&self, now: DateTime<Utc>, purge: PurgeMode) -> Result<Option<SyncRunSummary>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("previous sync run still active; skipping");
            return Ok(None);
        };
        self.run_locked(now, purge).await.map(Some)
    }

    /// Caller holds `run_guard`.
    async fn run_locked(&self, now: DateTime<Utc>, purge: PurgeMode) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        info!(%run_id, %now, "starting sync run");

        let mut sources = Vec::new();
        for source in self.registry.enabled() {
            let span = info_span!("source_run", %run_id, source = %source.name);
            sources.push(self.run_source(source, now).instrument(span).await);
        }

        let purge = match purge {
            PurgeMode::Force => self.purge_now(now).await,
            PurgeMode::Scheduled if is_cleanup_day(now, self.config.cleanup_weekday) => self.purge_now(now).await,
            PurgeMode::Scheduled | PurgeMode::Skip => PurgeStatus::NotScheduled,
        };

        let reports_dir = self.config.reports_root().join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            started_at: now,
            finished_at: Utc::now(),
            sources,
            purge,
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;

        info!(
            %run_id,
            sources = summary.sources.len(),
            failed = summary.failed_sources(),
            "sync run finished"
        );
        Ok(summary)
    }

    pub async fn purge_now(&self, now: DateTime<Utc>) -> PurgeStatus {
        match self.archive.run_weekly_purge(now).await {
            Ok(outcome) => {
                info!(
                    deleted = outcome.deleted.len(),
                    retained = outcome.retained,
                    failed = outcome.failed.len(),
                    "archive purge finished"
                );
                PurgeStatus::Completed(outcome)
            }
            Err(err) => {
                error!(error = %err, "archive purge failed");
                PurgeStatus::Failed { error: err.to_string() }
            }
        }
    }

    async fn run_source(&self, source: &SourceConfig, now: DateTime<Utc>) -> SourceRunReport {
        let mut report = SourceRunReport::new(&source.name);
        if let Err(err) = self.process_source(source, now, &mut report).await {
            error!(stage = %err.stage(), error = %err, "source run failed");
            report.outcome = SourceOutcome::Failed {
                stage: err.stage(),
                error: err.to_string(),
            };
        }
        report
    }

    /// load previous → merge → upload → archive, strictly in that order.
    async fn process_source(
        &self,
        source: &SourceConfig,
        now: DateTime<Utc>,
        report: &mut SourceRunReport,
    ) -> Result<(), SyncError> {
        let active = self.merge.active_files(&source.name).await?;
        report.previous_file = active.previous.as_ref().map(|f| f.name.clone());

        let previous = match &active.previous {
            Some(file) => Some(self.merge.read_dataset(&source.name, file).await?),
            None => None,
        };

        let batch_source = self.batch_source_for(source);
        let batch = batch_source
            .fresh_batch()
            .await
            .map_err(|cause| SyncError::BatchUnavailable {
                source_name: source.name.clone(),
                cause,
            })?;
        let batch_len = batch.len();
        let inputs = batch.inputs;

        let outcome = self
            .merge
            .merge(&source.name, &source.tracking_policy(), batch.records, previous, now);
        report.counts = outcome.counts;
        report.identities = outcome.dataset.identity_count();
        report.snapshots = outcome.dataset.snapshot_count();
        info!(
            batch = batch_len,
            inserted = outcome.counts.inserted,
            appended = outcome.counts.appended,
            discarded = outcome.counts.discarded,
            skipped = outcome.counts.skipped,
            "merged fresh batch"
        );

        // A first run always publishes, even for an empty batch, so the source has a baseline.
        let mut superseded = active.stale;
        if outcome.counts.changed() > 0 || active.previous.is_none() {
            let published = self.merge.publish(&outcome.dataset).await?;
            info!(file = %published.file.name, bytes = published.bytes, "uploaded merged dataset");
            report.upload = UploadStatus::Uploaded;
            report.uploaded_file = Some(published.file.name.clone());
            report.uploaded_sha256 = Some(published.sha256);
            superseded.extend(active.previous);
            superseded.retain(|f| f.id != published.file.id);
        } else {
            info!("no new or changed records; keeping previous merged dataset");
            report.upload = UploadStatus::SkippedUnchanged;
        }

        // The stored dataset now covers these inputs; a failure here only risks a replay,
        // which the capture-time check in the tracker discards.
        match batch_source.mark_consumed(&inputs).await {
            Ok(consumed) => report.consumed_inputs = consumed,
            Err(err) => warn!(error = %err, "could not retire consumed raw files"),
        }

        if superseded.is_empty() {
            report.archive = ArchiveStatus::NothingToArchive;
            return Ok(());
        }

        let archived = self.archive.archive_superseded(&source.name, &superseded).await;
        report.archived_files = archived.archived.iter().map(|e| e.file.name.clone()).collect();
        report.archive = if archived.failures.is_empty() {
            ArchiveStatus::Completed
        } else {
            ArchiveStatus::PartialFailure {
                errors: archived.failures.iter().map(ToString::to_string).collect(),
            }
        };
        Ok(())
    }

    fn batch_source_for(&self, source: &SourceConfig) -> Arc<dyn BatchSource> {
        self.batch_sources.get(&source.name).cloned().unwrap_or_else(|| {
            Arc::new(RawFileBatchSource::new(
                source.name.clone(),
                self.config.raw_dir.clone(),
                &source.raw_file_pattern,
            ))
        })
    }

    /// Cron ticks that land while a run is still in progress are skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.try_run_once_at(Utc::now(), PurgeMode::Scheduled).await {
                    Ok(None) => {}
                    Ok(Some(summary)) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed_sources(),
                        "scheduled sync run complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(())
}

pub fn run_brief_markdown(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Tenderwatch Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Sources: {} ({} failed)", summary.sources.len(), summary.failed_sources()),
        String::new(),
        "## Sources".to_string(),
    ];
    for source in &summary.sources {
        let status = match &source.outcome {
            SourceOutcome::Merged => "merged".to_string(),
            SourceOutcome::Failed { stage, error } => format!("FAILED at {stage}: {error}"),
        };
        lines.push(format!(
            "- {}: {} | inserted {} appended {} discarded {} skipped {} | identities {} snapshots {}",
            source.source,
            status,
            source.counts.inserted,
            source.counts.appended,
            source.counts.discarded,
            source.counts.skipped,
            source.identities,
            source.snapshots,
        ));
        if let Some(file) = &source.uploaded_file {
            lines.push(format!("  - uploaded `{file}`"));
        }
        if let ArchiveStatus::PartialFailure { errors } = &source.archive {
            lines.push(format!("  - partial archive failure: {}", errors.join("; ")));
        }
    }
    lines.push(String::new());
    lines.push(match &summary.purge {
        PurgeStatus::NotScheduled => "Archive purge: not scheduled".to_string(),
        PurgeStatus::Completed(outcome) => format!(
            "Archive purge: deleted {} retained {} failed {}",
            outcome.deleted.len(),
            outcome.retained,
            outcome.failed.len()
        ),
        PurgeStatus::Failed { error } => format!("Archive purge: FAILED ({error})"),
    });
    lines.push(String::new());
    lines.join("\n")
}

pub async fn run_sync_once_from_env(purge: PurgeMode) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(config.registry_path()).await?;
    let storage = build_storage(&config)?;
    let pipeline = SyncPipeline::new(config, registry, storage);
    pipeline.run_once(purge).await
}

/// Markdown overview of the `runs` most recent run reports.
pub fn report_recent_runs_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let summary_path = entry.path().join("run_summary.json");
        if !summary_path.exists() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        summaries.push(value);
    }
    summaries.sort_by(|a, b| {
        let started = |v: &serde_json::Value| v.get("started_at").and_then(|s| s.as_str()).map(str::to_owned);
        started(b).cmp(&started(a))
    });

    let mut lines = vec!["# Tenderwatch Recent Runs".to_string(), String::new()];
    for summary in summaries.into_iter().take(runs.max(1)) {
        let run_id = summary.get("run_id").and_then(|v| v.as_str()).unwrap_or("unknown-run");
        let started = summary.get("started_at").and_then(|v| v.as_str()).unwrap_or("-");
        lines.push(format!("## Run `{run_id}` ({started})"));
        for source in summary
            .get("sources")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let name = source.get("source").and_then(|v| v.as_str()).unwrap_or("?");
            let status = source
                .pointer("/outcome/status")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let count = |key: &str| {
                source
                    .pointer(&format!("/counts/{key}"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
            };
            lines.push(format!(
                "- {name}: {status} (inserted {}, appended {}, discarded {})",
                count("inserted"),
                count("appended"),
                count("discarded")
            ));
        }
        let purge = summary
            .pointer("/purge/status")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        lines.push(format!("- purge: {purge}"));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tenderwatch_adapters::StaticBatchSource;

    #[derive(Default)]
    struct MemoryStore {
        files: StdMutex<Vec<(FileRef, Vec<u8>)>>,
        failing_ops: StdMutex<HashSet<&'static str>>,
        clock: StdMutex<Option<DateTime<Utc>>>,
    }

    impl MemoryStore {
        fn fail(&self, op: &'static str) {
            self.failing_ops.lock().unwrap().insert(op);
        }

        fn check(&self, op: &'static str) -> Result<(), StorageError> {
            if self.failing_ops.lock().unwrap().contains(op) {
                return Err(StorageError::HttpStatus {
                    status: 503,
                    url: format!("memory://{op}"),
                });
            }
            Ok(())
        }

        fn set_clock(&self, now: DateTime<Utc>) {
            *self.clock.lock().unwrap() = Some(now);
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.lock().unwrap().unwrap_or_else(Utc::now)
        }

        fn put(&self, folder: &str, name: &str, bytes: &[u8], modified_time: DateTime<Utc>) -> FileRef {
            let file = FileRef {
                id: format!("{folder}/{name}"),
                name: name.to_string(),
                folder_id: folder.to_string(),
                modified_time,
            };
            let mut files = self.files.lock().unwrap();
            files.retain(|(f, _)| f.id != file.id);
            files.push((file.clone(), bytes.to_vec()));
            file
        }

        fn names_in(&self, folder: &str) -> Vec<String> {
            let mut names: Vec<_> = self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| f.folder_id == folder)
                .map(|(f, _)| f.name.clone())
                .collect();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl RemoteStorage for MemoryStore {
        async fn list_files(&self, folder_id: &str, pattern: &NamePattern) -> Result<Vec<FileRef>, StorageError> {
            self.check("list")?;
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| f.folder_id == folder_id && pattern.matches(&f.name))
                .map(|(f, _)| f.clone())
                .collect())
        }

        async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>, StorageError> {
            self.check("download")?;
            self.files
                .lock()
                .unwrap()
                .iter()
                .find(|(f, _)| f.id == file.id)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| StorageError::NotFound(file.id.clone()))
        }

        async fn upload_file(&self, folder_id: &str, name: &str, bytes: &[u8]) -> Result<FileRef, StorageError> {
            self.check("upload")?;
            Ok(self.put(folder_id, name, bytes, self.now()))
        }

        async fn move_file(&self, file: &FileRef, destination_folder_id: &str) -> Result<FileRef, StorageError> {
            self.check("move")?;
            let bytes = {
                let mut files = self.files.lock().unwrap();
                let index = files
                    .iter()
                    .position(|(f, _)| f.id == file.id)
                    .ok_or_else(|| StorageError::NotFound(file.id.clone()))?;
                files.remove(index).1
            };
            Ok(self.put(destination_folder_id, &file.name, &bytes, self.now()))
        }

        async fn delete_file(&self, file: &FileRef) -> Result<(), StorageError> {
            self.check("delete")?;
            self.files.lock().unwrap().retain(|(f, _)| f.id != file.id);
            Ok(())
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    fn tender(id: &str, title: &str, scraped_at: DateTime<Utc>) -> Record {
        Record::from_value(json!({
            "tenderId": id,
            "tenderName": title,
            "scrapedAt": scraped_at.to_rfc3339(),
        }))
        .unwrap()
    }

    fn registry(names: &[&str]) -> SourceRegistry {
        SourceRegistry {
            sources: names
                .iter()
                .map(|name| SourceConfig {
                    name: name.to_string(),
                    display_name: None,
                    enabled: true,
                    raw_file_pattern: format!("{name}_*.json"),
                    identity_fields: default_identity_fields(),
                    volatile_fields: None,
                    ignore_private_fields: true,
                    notes: None,
                })
                .collect(),
        }
    }

    fn config(root: &Path) -> SyncConfig {
        SyncConfig {
            workspace_root: root.to_path_buf(),
            raw_dir: root.join("output"),
            storage: StorageBackend::Local {
                root: root.join("storage"),
            },
            active_folder: "merged".to_string(),
            archive_folder: "_archive".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            cleanup_weekday: Weekday::Sun,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            user_agent: "tenderwatch-test".to_string(),
            http_timeout_secs: 5,
        }
    }

    fn pipeline(root: &Path, store: Arc<MemoryStore>, names: &[&str], batches: Vec<(&str, Vec<Record>)>) -> SyncPipeline {
        let mut pipeline = SyncPipeline::new(config(root), registry(names), store);
        for (source, records) in batches {
            pipeline = pipeline.with_batch_source(Arc::new(StaticBatchSource::new(source, records)));
        }
        pipeline
    }

    fn merged_bytes(source: &str, records: Vec<Record>, generated_at: DateTime<Utc>) -> Vec<u8> {
        merge(source, &TrackingPolicy::default(), records, None, generated_at)
            .dataset
            .to_json_bytes()
            .unwrap()
    }

    #[test]
    fn registry_parses_defaults_and_rejects_bad_names() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - name: tender
    raw_file_pattern: "tender_announcement_*.json"
  - name: promotion
    enabled: false
    raw_file_pattern: "procurement_*.json"
    identity_fields: [agency, tenderId]
    volatile_fields: [scrapedAt]
    ignore_private_fields: false
"#,
        )
        .expect("registry");
        assert_eq!(registry.enabled().count(), 1);
        let tender = &registry.sources[0];
        assert!(tender.enabled);
        assert_eq!(tender.identity_fields, vec!["tenderId".to_string()]);
        assert!(tender.tracking_policy().normalizer.is_volatile("updatedAt"));

        let promotion = registry.sources[1].tracking_policy();
        assert_eq!(promotion.identity.fields(), ["agency".to_string(), "tenderId".to_string()]);
        assert!(!promotion.normalizer.is_volatile("updatedAt"));
        assert!(!promotion.normalizer.is_volatile("_private"));

        for bad in ["tender_merged_x", "a/b", ""] {
            let yaml = format!("sources:\n  - name: \"{bad}\"\n    raw_file_pattern: \"*.json\"\n");
            assert!(SourceRegistry::from_yaml_str(&yaml).is_err(), "{bad} should be rejected");
        }
        let dup = "sources:\n  - name: a\n    raw_file_pattern: x\n  - name: a\n    raw_file_pattern: y\n";
        assert!(SourceRegistry::from_yaml_str(dup).is_err());
    }

    #[test]
    fn workspace_sources_yaml_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let text = std::fs::read_to_string(path).expect("read sources.yaml");
        let registry = SourceRegistry::from_yaml_str(&text).expect("registry");
        let names: Vec<_> = registry.enabled().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["tender", "public_read", "promotion"]);
    }

    #[test]
    fn previous_is_newest_by_modification_time_then_name() {
        let file = |name: &str, modified: DateTime<Utc>| FileRef {
            id: name.to_string(),
            name: name.to_string(),
            folder_id: "merged".to_string(),
            modified_time: modified,
        };
        let active = select_previous(
            vec![
                file("tender_merged_20260301_060000.json", at(1, 6)),
                file("tender_merged_20260303_060000.json", at(3, 6)),
                file("tender_merged_20260302_060000.json", at(3, 6)),
                file("tender_merged_notes.json", at(9, 0)),
                file("tender_merged_20260309_060000.json.bak", at(9, 0)),
            ],
            "tender",
        );
        assert_eq!(
            active.previous.map(|f| f.name),
            Some("tender_merged_20260303_060000.json".to_string())
        );
        let stale: Vec<_> = active.stale.into_iter().map(|f| f.name).collect();
        assert_eq!(
            stale,
            vec!["tender_merged_20260301_060000.json", "tender_merged_20260302_060000.json"]
        );
        assert_eq!(select_previous(Vec::new(), "tender"), ActiveFiles::default());
    }

    #[test]
    fn cleanup_day_predicate_uses_injected_time() {
        assert!(is_cleanup_day(at(1, 6), Weekday::Sun));
        assert!(!is_cleanup_day(at(2, 6), Weekday::Sun));
        assert!(is_cleanup_day(at(2, 6), Weekday::Mon));
    }

    #[tokio::test]
    async fn load_previous_is_absent_on_first_run() {
        let store = Arc::new(MemoryStore::default());
        let engine = MergeEngine::new(store, "merged");
        assert!(engine.load_previous("tender").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn corrupt_previous_fails_instead_of_starting_over() {
        let store = Arc::new(MemoryStore::default());
        store.put("merged", "tender_merged_20260301_060000.json", b"{\"source\":", at(1, 6));
        let engine = MergeEngine::new(store, "merged");
        let err = engine.load_previous("tender").await.expect_err("corrupt");
        assert!(matches!(err, SyncError::CorruptPreviousDataset { .. }));
        assert_eq!(err.stage(), Stage::ParsePrevious);
    }

    #[tokio::test]
    async fn storage_failures_are_not_masked_as_first_run() {
        let store = Arc::new(MemoryStore::default());
        store.fail("list");
        let engine = MergeEngine::new(store, "merged");
        let err = engine.load_previous("tender").await.expect_err("unavailable");
        assert!(matches!(
            err,
            SyncError::StorageUnavailable {
                stage: Stage::ListActive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn run_uploads_then_archives_previous() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(
            "merged",
            "tender_merged_20260301_060000.json",
            &merged_bytes("tender", vec![tender("1", "X", at(1, 0))], at(1, 6)),
            at(1, 6),
        );
        store.set_clock(at(2, 6));

        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender"],
            vec![("tender", vec![tender("1", "Y", at(2, 0)), tender("2", "Z", at(2, 0))])],
        );
        let summary = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("run");
        let report = summary.source("tender").expect("report");

        assert_eq!(report.outcome, SourceOutcome::Merged);
        assert_eq!(report.counts.appended, 1);
        assert_eq!(report.counts.inserted, 1);
        assert_eq!(report.upload, UploadStatus::Uploaded);
        assert_eq!(report.archive, ArchiveStatus::Completed);
        assert_eq!(report.uploaded_file.as_deref(), Some("tender_merged_20260302_060000.json"));
        assert_eq!(report.uploaded_sha256.as_ref().map(String::len), Some(64));
        assert_eq!(store.names_in("merged"), vec!["tender_merged_20260302_060000.json"]);
        assert_eq!(store.names_in("_archive"), vec!["tender_merged_20260301_060000.json"]);
        assert!(Path::new(&summary.reports_dir).join("run_summary.json").exists());
        assert!(Path::new(&summary.reports_dir).join("run_brief.md").exists());
    }

    #[tokio::test]
    async fn unchanged_run_skips_upload_but_archives_stale_leftovers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let records = vec![tender("1", "X", at(1, 0))];
        store.put(
            "merged",
            "tender_merged_20260301_060000.json",
            &merged_bytes("tender", records.clone(), at(1, 6)),
            at(1, 6),
        );
        store.put(
            "merged",
            "tender_merged_20260302_060000.json",
            &merged_bytes("tender", records, at(2, 6)),
            at(2, 6),
        );
        store.set_clock(at(3, 6));

        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender"],
            vec![("tender", vec![tender("1", "X", at(3, 0))])],
        );
        let summary = pipeline.run_once_at(at(3, 6), PurgeMode::Skip).await.expect("run");
        let report = summary.source("tender").expect("report");

        assert_eq!(report.counts.discarded, 1);
        assert_eq!(report.upload, UploadStatus::SkippedUnchanged);
        assert_eq!(report.previous_file.as_deref(), Some("tender_merged_20260302_060000.json"));
        assert_eq!(report.archived_files, vec!["tender_merged_20260301_060000.json"]);
        assert_eq!(store.names_in("merged"), vec!["tender_merged_20260302_060000.json"]);
    }

    #[tokio::test]
    async fn empty_batch_publishes_baseline_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.set_clock(at(2, 6));
        let pipeline = pipeline(dir.path(), store.clone(), &["tender"], vec![("tender", Vec::new())]);

        let first = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("first run");
        let report = first.source("tender").expect("report");
        assert_eq!(report.outcome, SourceOutcome::Merged);
        assert_eq!(report.upload, UploadStatus::Uploaded);
        assert_eq!(report.identities, 0);
        assert_eq!(report.archive, ArchiveStatus::NothingToArchive);
        assert_eq!(store.names_in("merged"), vec!["tender_merged_20260302_060000.json"]);

        let second = pipeline.run_once_at(at(3, 6), PurgeMode::Skip).await.expect("second run");
        let report = second.source("tender").expect("report");
        assert_eq!(report.upload, UploadStatus::SkippedUnchanged);
        assert_eq!(store.names_in("merged"), vec!["tender_merged_20260302_060000.json"]);
    }

    #[tokio::test]
    async fn failed_archive_move_is_reported_as_partial() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(
            "merged",
            "tender_merged_20260301_060000.json",
            &merged_bytes("tender", vec![tender("1", "X", at(1, 0))], at(1, 6)),
            at(1, 6),
        );
        store.set_clock(at(2, 6));
        store.fail("move");

        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender"],
            vec![("tender", vec![tender("1", "Y", at(2, 0))])],
        );
        let summary = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("run");
        let report = summary.source("tender").expect("report");

        assert_eq!(report.outcome, SourceOutcome::Merged);
        assert_eq!(report.upload, UploadStatus::Uploaded);
        assert!(matches!(&report.archive, ArchiveStatus::PartialFailure { errors } if errors.len() == 1));
        assert_eq!(
            store.names_in("merged"),
            vec!["tender_merged_20260301_060000.json", "tender_merged_20260302_060000.json"]
        );
    }

    #[tokio::test]
    async fn one_failing_source_does_not_block_the_others() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put("merged", "tender_merged_20260301_060000.json", b"[]", at(1, 6));
        store.set_clock(at(2, 6));

        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender", "public_read"],
            vec![
                ("tender", vec![tender("1", "X", at(2, 0))]),
                ("public_read", vec![tender("P1", "R", at(2, 0))]),
            ],
        );
        let summary = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("run");

        let tender_report = summary.source("tender").expect("tender");
        assert!(matches!(
            tender_report.outcome,
            SourceOutcome::Failed {
                stage: Stage::ParsePrevious,
                ..
            }
        ));
        assert_eq!(tender_report.upload, UploadStatus::NotAttempted);
        assert_eq!(summary.source("public_read").expect("public").counts.inserted, 1);
        assert_eq!(summary.failed_sources(), 1);
        assert!(store
            .names_in("merged")
            .contains(&"public_read_merged_20260302_060000.json".to_string()));
    }

    #[tokio::test]
    async fn upload_failure_leaves_previous_active() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(
            "merged",
            "tender_merged_20260301_060000.json",
            &merged_bytes("tender", vec![tender("1", "X", at(1, 0))], at(1, 6)),
            at(1, 6),
        );
        store.fail("upload");

        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender"],
            vec![("tender", vec![tender("1", "Y", at(2, 0))])],
        );
        let summary = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("run");
        let report = summary.source("tender").expect("report");
        assert!(matches!(
            report.outcome,
            SourceOutcome::Failed {
                stage: Stage::Upload,
                ..
            }
        ));
        assert_eq!(report.archive, ArchiveStatus::NotAttempted);
        assert_eq!(store.names_in("merged"), vec!["tender_merged_20260301_060000.json"]);
    }

    #[tokio::test]
    async fn weekly_purge_respects_retention_and_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let now = at(29, 6);
        store.put("_archive", "tender_merged_20260101_060000.json", b"{}", now - chrono::Duration::days(31));
        store.put("_archive", "tender_merged_20260201_060000.json", b"{}", now - chrono::Duration::days(29));
        store.put("_archive", "tender_merged_20260227_060000.json", b"{}", now - chrono::Duration::days(30));
        store.put("_archive", "notes.txt", b"", now - chrono::Duration::days(90));

        let manager = ArchiveManager::new(store.clone(), "_archive", DEFAULT_RETENTION_DAYS);
        let first = manager.run_weekly_purge(now).await.expect("purge");
        assert_eq!(first.deleted, vec!["tender_merged_20260101_060000.json"]);
        // Exactly the retention window old is still kept.
        assert_eq!(first.retained, 2);
        assert!(first.failed.is_empty());

        let second = manager.run_weekly_purge(now).await.expect("purge again");
        assert!(second.deleted.is_empty());
        assert_eq!(second.retained, 2);
        assert_eq!(
            store.names_in("_archive"),
            vec![
                "notes.txt",
                "tender_merged_20260201_060000.json",
                "tender_merged_20260227_060000.json"
            ]
        );
    }

    #[tokio::test]
    async fn replayed_batch_does_not_grow_history() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.set_clock(at(2, 6));
        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender"],
            vec![("tender", vec![tender("1", "X", at(1, 0)), tender("1", "Y", at(2, 0))])],
        );

        let first = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("first run");
        let report = first.source("tender").expect("report");
        assert_eq!((report.counts.inserted, report.counts.appended), (1, 1));
        assert_eq!(report.snapshots, 2);

        for (day, run) in [(3, "second run"), (4, "third run")] {
            store.set_clock(at(day, 6));
            let summary = pipeline.run_once_at(at(day, 6), PurgeMode::Skip).await.expect(run);
            let report = summary.source("tender").expect("report");
            assert_eq!(report.counts.changed(), 0);
            assert_eq!(report.counts.discarded, 2);
            assert_eq!(report.snapshots, 2);
            assert_eq!(report.upload, UploadStatus::SkippedUnchanged);
        }
        assert_eq!(store.names_in("merged"), vec!["tender_merged_20260302_060000.json"]);
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline(
            dir.path(),
            store.clone(),
            &["tender"],
            vec![("tender", vec![tender("1", "X", at(1, 0))])],
        );

        let held = pipeline.run_guard.lock().await;
        let skipped = pipeline
            .try_run_once_at(at(2, 6), PurgeMode::Skip)
            .await
            .expect("try run");
        assert!(skipped.is_none());
        assert!(store.names_in("merged").is_empty());
        drop(held);

        let ran = pipeline
            .try_run_once_at(at(2, 6), PurgeMode::Skip)
            .await
            .expect("try run");
        assert_eq!(ran.expect("run not skipped").source("tender").expect("report").counts.inserted, 1);
    }

    #[tokio::test]
    async fn purge_only_runs_on_cleanup_day_when_scheduled() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline(dir.path(), store.clone(), &[], Vec::new());

        let monday = pipeline.run_once_at(at(2, 6), PurgeMode::Scheduled).await.expect("run");
        assert_eq!(monday.purge, PurgeStatus::NotScheduled);

        let sunday = pipeline.run_once_at(at(1, 6), PurgeMode::Scheduled).await.expect("run");
        assert!(matches!(sunday.purge, PurgeStatus::Completed(_)));

        store.fail("list");
        let forced = pipeline.run_once_at(at(2, 6), PurgeMode::Force).await.expect("run");
        assert!(matches!(forced.purge, PurgeStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn recent_runs_report_lists_newest_first() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.set_clock(at(1, 6));
        let pipeline = pipeline(
            dir.path(),
            store,
            &["tender"],
            vec![("tender", vec![tender("1", "X", at(1, 0))])],
        );
        let first = pipeline.run_once_at(at(1, 6), PurgeMode::Skip).await.expect("run");
        let second = pipeline.run_once_at(at(2, 6), PurgeMode::Skip).await.expect("run");

        let markdown = report_recent_runs_markdown(5, Some(dir.path().to_path_buf())).expect("report");
        let first_pos = markdown.find(&first.run_id.to_string()).expect("first run listed");
        let second_pos = markdown.find(&second.run_id.to_string()).expect("second run listed");
        assert!(second_pos < first_pos);
        assert!(markdown.contains("- tender: merged (inserted 1, appended 0, discarded 0)"));
        assert!(markdown.contains("- tender: merged (inserted 0, appended 0, discarded 1)"));
    }
}
