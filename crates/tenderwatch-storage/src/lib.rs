//! Remote file store contract plus local-folder and Google Drive backends for tenderwatch.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tenderwatch-storage";

/// Handle to one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    pub folder_id: String,
    pub modified_time: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid folder id `{0}`")]
    InvalidFolder(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::HttpStatus { status, .. } => *status == StatusCode::NOT_FOUND.as_u16(),
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// The five operations the merge and archive stages are allowed to use.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn list_files(&self, folder_id: &str, pattern: &NamePattern) -> Result<Vec<FileRef>, StorageError>;

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>, StorageError>;

    async fn upload_file(&self, folder_id: &str, name: &str, bytes: &[u8]) -> Result<FileRef, StorageError>;

    /// Relocates `file`; the returned ref's `modified_time` is the time of the move.
    async fn move_file(&self, file: &FileRef, destination_folder_id: &str) -> Result<FileRef, StorageError>;

    /// Deleting an already-deleted file succeeds.
    async fn delete_file(&self, file: &FileRef) -> Result<(), StorageError>;
}

/// File name glob: `*` matches any run of characters, `?` exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    pattern: Vec<char>,
}

impl NamePattern {
    pub fn new(pattern: impl AsRef<str>) -> Self {
        Self {
            pattern: pattern.as_ref().chars().collect(),
        }
    }

    pub fn any() -> Self {
        Self::new("*")
    }

    pub fn as_string(&self) -> String {
        self.pattern.iter().collect()
    }

    /// Literal text before the first wildcard.
    pub fn literal_prefix(&self) -> String {
        self.pattern
            .iter()
            .take_while(|c| !matches!(c, '*' | '?'))
            .collect()
    }

    pub fn matches(&self, name: &str) -> bool {
        let name: Vec<char> = name.chars().collect();
        let (mut p, mut n) = (0usize, 0usize);
        let mut backtrack: Option<(usize, usize)> = None;

        while n < name.len() {
            match self.pattern.get(p) {
                Some('*') => {
                    backtrack = Some((p, n));
                    p += 1;
                }
                Some('?') => {
                    p += 1;
                    n += 1;
                }
                Some(c) if *c == name[n] => {
                    p += 1;
                    n += 1;
                }
                _ => match backtrack {
                    Some((star_p, star_n)) => {
                        p = star_p + 1;
                        n = star_n + 1;
                        backtrack = Some((star_p, star_n + 1));
                    }
                    None => return false,
                },
            }
        }
        self.pattern[p..].iter().all(|c| *c == '*')
    }
}

/// Folders are subdirectories of `root`; file ids are `<folder>/<name>`.
#[derive(Debug, Clone)]
pub struct LocalFolderStore {
    root: PathBuf,
}

impl LocalFolderStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_path(&self, folder_id: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(folder_id);
        let valid = !folder_id.trim().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(StorageError::InvalidFolder(folder_id.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn file_path(&self, file: &FileRef) -> Result<PathBuf, StorageError> {
        Ok(self.folder_path(&file.folder_id)?.join(&file.name))
    }

    async fn file_ref(&self, folder_id: &str, name: &str, path: &Path) -> Result<FileRef, StorageError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|err| StorageError::io(path, err))?;
        let modified = metadata.modified().map_err(|err| StorageError::io(path, err))?;
        Ok(FileRef {
            id: format!("{folder_id}/{name}"),
            name: name.to_string(),
            folder_id: folder_id.to_string(),
            modified_time: DateTime::<Utc>::from(modified),
        })
    }
}

async fn restamp_modified(path: &Path) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await?.into_std().await;
    file.set_modified(SystemTime::now())
}

#[async_trait]
impl RemoteStorage for LocalFolderStore {
    async fn list_files(&self, folder_id: &str, pattern: &NamePattern) -> Result<Vec<FileRef>, StorageError> {
        let dir = self.folder_path(folder_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&dir, err)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::io(&dir, err))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !pattern.matches(&name) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| StorageError::io(entry.path(), err))?;
            if !file_type.is_file() {
                continue;
            }
            files.push(self.file_ref(folder_id, &name, &entry.path()).await?);
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>, StorageError> {
        let path = self.file_path(file)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(file.id.clone())),
            Err(err) => Err(StorageError::io(&path, err)),
        }
    }

    /// Atomic temp-file write and rename; an existing file of the same name is replaced.
    async fn upload_file(&self, folder_id: &str, name: &str, bytes: &[u8]) -> Result<FileRef, StorageError> {
        let dir = self.folder_path(folder_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;

        let target = dir.join(name);
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StorageError::io(&temp_path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| StorageError::io(&temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| StorageError::io(&temp_path, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(&target, err));
        }
        self.file_ref(folder_id, name, &target).await
    }

    async fn move_file(&self, file: &FileRef, destination_folder_id: &str) -> Result<FileRef, StorageError> {
        let from = self.file_path(file)?;
        let dest_dir = self.folder_path(destination_folder_id)?;
        fs::create_dir_all(&dest_dir)
            .await
            .map_err(|err| StorageError::io(&dest_dir, err))?;
        let to = dest_dir.join(&file.name);

        if from != to {
            match fs::rename(&from, &to).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::NotFound(file.id.clone()))
                }
                Err(err) => return Err(StorageError::io(&from, err)),
            }
        }

        // The file has moved; a failed restamp must not report the move as failed.
        if let Err(err) = restamp_modified(&to).await {
            warn!(path = %to.display(), error = %err, "moved file but could not restamp its modification time");
        }
        self.file_ref(destination_folder_id, &file.name, &to).await
    }

    async fn delete_file(&self, file: &FileRef) -> Result<(), StorageError> {
        let path = self.file_path(file)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(&path, err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const DRIVE_FILE_FIELDS: &str = "id,name,modifiedTime,parents";
const DRIVE_FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Pre-issued OAuth bearer token.
    pub access_token: String,
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl DriveConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_base: DRIVE_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Google Drive v3 backend; folder ids are Drive folder ids.
#[derive(Debug)]
pub struct DriveStore {
    client: reqwest::Client,
    access_token: String,
    api_base: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileResource {
    id: String,
    name: String,
    modified_time: DateTime<Utc>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

impl DriveFileResource {
    fn into_file_ref(self, fallback_folder: &str) -> FileRef {
        let folder_id = self
            .parents
            .into_iter()
            .next()
            .unwrap_or_else(|| fallback_folder.to_string());
        FileRef {
            id: self.id,
            name: self.name,
            folder_id,
            modified_time: self.modified_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFileResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl DriveStore {
    pub fn new(config: DriveConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            access_token: config.access_token,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/drive/v3/files/{}", self.api_base, file_id)
    }

    /// Sends with transport-level retries on 5xx/429, timeouts and connect failures.
    async fn send<F>(&self, op: &'static str, build: F) -> Result<reqwest::Response, StorageError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let span = info_span!("drive_request", op);
        async {
            let mut attempt = 0usize;
            loop {
                match build().bearer_auth(&self.access_token).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, status = status.as_u16(), "retrying drive request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(StorageError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, error = %err, "retrying drive request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(StorageError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn read_file_resource(resp: reqwest::Response) -> Result<DriveFileResource, StorageError> {
        resp.json::<DriveFileResource>()
            .await
            .map_err(|err| StorageError::Decode(err.to_string()))
    }
}

#[async_trait]
impl RemoteStorage for DriveStore {
    async fn list_files(&self, folder_id: &str, pattern: &NamePattern) -> Result<Vec<FileRef>, StorageError> {
        let query = drive_list_query(folder_id, pattern);
        let fields = format!("nextPageToken,files({DRIVE_FILE_FIELDS},mimeType)");
        let mut page_token: Option<String> = None;
        let mut files = Vec::new();

        loop {
            let resp = self
                .send("list_files", || {
                    let mut req = self.client.get(self.files_url()).query(&[
                        ("q", query.as_str()),
                        ("fields", fields.as_str()),
                        ("pageSize", "1000"),
                        ("supportsAllDrives", "true"),
                        ("includeItemsFromAllDrives", "true"),
                    ]);
                    if let Some(token) = &page_token {
                        req = req.query(&[("pageToken", token.as_str())]);
                    }
                    req
                })
                .await?;
            let page: DriveFileList = resp
                .json()
                .await
                .map_err(|err| StorageError::Decode(err.to_string()))?;

            files.extend(
                page.files
                    .into_iter()
                    .filter(|f| f.mime_type.as_deref() != Some(DRIVE_FOLDER_MIME))
                    .filter(|f| pattern.matches(&f.name))
                    .map(|f| f.into_file_ref(folder_id)),
            );

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(folder_id, count = files.len(), "listed drive folder");
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .send("download_file", || {
                self.client
                    .get(self.file_url(&file.id))
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            })
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn upload_file(&self, folder_id: &str, name: &str, bytes: &[u8]) -> Result<FileRef, StorageError> {
        let boundary = format!("tenderwatch-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, folder_id, name, bytes);
        let url = format!("{}/upload/drive/v3/files", self.api_base);

        let resp = self
            .send("upload_file", || {
                self.client
                    .post(&url)
                    .query(&[
                        ("uploadType", "multipart"),
                        ("fields", DRIVE_FILE_FIELDS),
                        ("supportsAllDrives", "true"),
                    ])
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body.clone())
            })
            .await?;
        Ok(Self::read_file_resource(resp).await?.into_file_ref(folder_id))
    }

    async fn move_file(&self, file: &FileRef, destination_folder_id: &str) -> Result<FileRef, StorageError> {
        let moved_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let resp = self
            .send("move_file", || {
                self.client
                    .patch(self.file_url(&file.id))
                    .query(&[
                        ("addParents", destination_folder_id),
                        ("removeParents", file.folder_id.as_str()),
                        ("fields", DRIVE_FILE_FIELDS),
                        ("supportsAllDrives", "true"),
                    ])
                    .json(&serde_json::json!({ "modifiedTime": moved_at }))
            })
            .await?;
        Ok(Self::read_file_resource(resp)
            .await?
            .into_file_ref(destination_folder_id))
    }

    async fn delete_file(&self, file: &FileRef) -> Result<(), StorageError> {
        let result = self
            .send("delete_file", || {
                self.client
                    .delete(self.file_url(&file.id))
                    .query(&[("supportsAllDrives", "true")])
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn escape_drive_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Narrows server-side by parent and literal prefix; the glob itself is applied client-side.
pub fn drive_list_query(folder_id: &str, pattern: &NamePattern) -> String {
    let mut query = format!(
        "'{}' in parents and trashed = false",
        escape_drive_literal(folder_id)
    );
    let prefix = pattern.literal_prefix();
    if !prefix.is_empty() {
        query.push_str(&format!(" and name contains '{}'", escape_drive_literal(&prefix)));
    }
    query
}

fn multipart_related_body(boundary: &str, folder_id: &str, name: &str, bytes: &[u8]) -> Vec<u8> {
    let metadata = serde_json::json!({
        "name": name,
        "parents": [folder_id],
        "mimeType": "application/json",
    });
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n").as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: application/json\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
