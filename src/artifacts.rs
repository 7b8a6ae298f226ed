//! Ephemeral artifacts produced by fetches.
//!
//! Each artifact moves through `Allocated -> Fetching -> Ready -> Expiring`
//! and ends in `Deleted`, or in `FetchFailed` when the engine errors or no
//! output can be located. Terminal artifacts are dropped from the registry.
//! The expiry timer is armed only once the produced file has been confirmed
//! on disk, and every timer stays registered so it can be replaced or
//! cancelled on shutdown.

use std::{
    cmp::Reverse,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use axum::body::Body;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    engine::FetchJob,
    extraction::{ExtractionError, Extractor},
    filename::{content_type_for_filename, download_name},
};

/// Opaque artifact handle. Doubles as the on-disk file name prefix and as
/// the token handed to clients, so it carries full UUIDv4 entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(token: &str) -> Option<Self> {
        Uuid::parse_str(token.trim()).ok().map(Self)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Allocated,
    Fetching,
    Ready,
    Expiring,
    Deleted,
    FetchFailed,
}

#[derive(Debug)]
struct ArtifactRecord {
    state: ArtifactState,
    created_at: DateTime<Utc>,
    path: Option<PathBuf>,
    download_name: Option<String>,
    expiry: Option<AbortHandle>,
}

impl ArtifactRecord {
    fn allocated() -> Self {
        Self {
            state: ArtifactState::Allocated,
            created_at: Utc::now(),
            path: None,
            download_name: None,
            expiry: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("engine finished but no file named {id}.* was produced")]
    ProducedFileMissing { id: ArtifactId },
    #[error("artifact is {size_bytes} bytes, above the {max_bytes} byte limit")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
    #[error("artifact storage failed while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("artifact is not ready")]
    NotReady,
    #[error("artifact has expired or never existed")]
    Gone,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub id: ArtifactId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub download_name: String,
}

pub struct ServedArtifact {
    pub body: Body,
    pub download_name: String,
    pub content_type: &'static str,
    pub content_length: u64,
}

pub struct ArtifactManager {
    dir: PathBuf,
    max_bytes: u64,
    records: Arc<DashMap<ArtifactId, ArtifactRecord>>,
}

impl ArtifactManager {
    pub fn new(dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            dir,
            max_bytes,
            records: Arc::new(DashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Reserves a fresh identifier. Identifiers are never reused while a
    /// record for them is alive.
    pub fn allocate(&self) -> ArtifactId {
        loop {
            let id = ArtifactId::generate();
            if let Entry::Vacant(slot) = self.records.entry(id) {
                slot.insert(ArtifactRecord::allocated());
                return id;
            }
        }
    }

    pub fn state(&self, id: ArtifactId) -> Option<ArtifactState> {
        self.records.get(&id).map(|record| record.state)
    }

    pub fn pending_expiries(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.expiry.is_some())
            .count()
    }

    /// Runs the engine for `id` and returns the file it actually produced.
    ///
    /// The engine picks the final extension, and muxing can rename its
    /// output, so the reported path is only a hint: the artifact directory
    /// is scanned for files carrying the identifier prefix.
    pub async fn fetch(
        &self,
        extractor: &Extractor,
        url: &str,
        selector: &str,
        id: ArtifactId,
        title_hint: Option<&str>,
    ) -> Result<ResolvedArtifact, FetchError> {
        self.set_state(id, ArtifactState::Fetching);
        let mut pending = PendingFetch {
            dir: self.dir.clone(),
            records: Arc::clone(&self.records),
            id,
            settled: false,
        };

        let job = FetchJob {
            url: url.to_string(),
            selector: selector.to_string(),
            output_template: self
                .dir
                .join(format!("{id}.%(ext)s"))
                .to_string_lossy()
                .into_owned(),
        };

        let report = match extractor.fetch(&job).await {
            Ok(report) => report,
            Err(error) => {
                self.discard(id).await;
                pending.settled = true;
                return Err(error.into());
            }
        };

        let located = self
            .locate_produced_file(id, report.filepath.as_deref())
            .await;
        let (path, size_bytes) = match located {
            Ok(Some(found)) => found,
            Ok(None) => {
                warn!(
                    %id,
                    nominal = ?report.filepath,
                    "engine reported success but no output file exists"
                );
                self.discard(id).await;
                pending.settled = true;
                return Err(FetchError::ProducedFileMissing { id });
            }
            Err(source) => {
                self.discard(id).await;
                pending.settled = true;
                return Err(FetchError::Io {
                    context: "scanning the artifact directory",
                    source,
                });
            }
        };

        if size_bytes > self.max_bytes {
            warn!(%id, size_bytes, max_bytes = self.max_bytes, "artifact over size limit");
            self.discard(id).await;
            pending.settled = true;
            return Err(FetchError::TooLarge {
                size_bytes,
                max_bytes: self.max_bytes,
            });
        }

        let download_name = download_name(report.title.as_deref().or(title_hint), &path);

        pending.settled = true;
        let registered = match self.records.get_mut(&id) {
            Some(mut record) => {
                record.state = ArtifactState::Ready;
                record.path = Some(path.clone());
                record.download_name = Some(download_name.clone());
                true
            }
            None => false,
        };
        if !registered {
            warn!(%id, "artifact released while fetching");
            remove_artifact_file(&path).await;
            return Err(FetchError::ProducedFileMissing { id });
        }

        info!(%id, size_bytes, file = %download_name, "artifact ready");
        Ok(ResolvedArtifact {
            id,
            path,
            size_bytes,
            download_name,
        })
    }

    /// Arms (or re-arms) the one-shot deletion timer for a ready artifact.
    /// Returns `false` when there is no produced file to expire.
    pub fn schedule_expiry(&self, id: ArtifactId, delay: Duration) -> bool {
        let Some(mut record) = self.records.get_mut(&id) else {
            return false;
        };
        let Some(path) = record.path.clone() else {
            return false;
        };

        if let Some(previous) = record.expiry.take() {
            previous.abort();
        }

        let records = Arc::clone(&self.records);
        let created_at = record.created_at;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remove_artifact_file(&path).await;
            release(&records, id, ArtifactState::Deleted);
            debug!(
                %id,
                age_seconds = (Utc::now() - created_at).num_seconds(),
                "artifact expired"
            );
        });

        record.state = ArtifactState::Expiring;
        record.expiry = Some(task.abort_handle());
        true
    }

    /// Opens a read-only stream over a ready artifact.
    pub async fn serve(&self, id: ArtifactId) -> Result<ServedArtifact, ServeError> {
        let (path, name) = {
            let record = self.records.get(&id).ok_or(ServeError::Gone)?;
            match (record.state, record.path.as_ref()) {
                (ArtifactState::Ready | ArtifactState::Expiring, Some(path)) => (
                    path.clone(),
                    record
                        .download_name
                        .clone()
                        .unwrap_or_else(|| download_name(None, path)),
                ),
                _ => return Err(ServeError::NotReady),
            }
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(ServeError::Gone),
            Err(error) => return Err(error.into()),
        };
        let content_length = file.metadata().await?.len();

        Ok(ServedArtifact {
            body: Body::from_stream(ReaderStream::new(file)),
            content_type: content_type_for_filename(&name),
            download_name: name,
            content_length,
        })
    }

    /// Cancels every pending timer and deletes the files they guarded.
    pub async fn shutdown(&self) -> usize {
        let ids = self
            .records
            .iter()
            .map(|record| *record.key())
            .collect::<Vec<_>>();

        let mut removed = 0;
        for id in ids {
            let Some((_, record)) = self.records.remove(&id) else {
                continue;
            };
            if let Some(expiry) = record.expiry {
                expiry.abort();
            }
            match record.path {
                Some(path) => {
                    if remove_artifact_file(&path).await {
                        removed += 1;
                    }
                }
                None => remove_partial_output(&self.dir, id).await,
            }
        }

        info!(removed, "released artifacts on shutdown");
        removed
    }

    /// Deletes files left in the artifact directory by an earlier process.
    /// Files that belong to a live record are kept.
    pub async fn sweep_orphans(&self, older_than: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("could not open artifact directory for cleanup: {error}");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("could not iterate artifact directory for cleanup: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            let path = entry.path();
            if self.is_live(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("could not read metadata of {:?}: {error}", path);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified_at| now.duration_since(modified_at).ok())
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }

            if remove_artifact_file(&path).await {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "removed orphaned artifacts");
        }
        removed
    }

    fn is_live(&self, file_name: &str) -> bool {
        file_name
            .get(..36)
            .and_then(ArtifactId::parse)
            .is_some_and(|id| self.records.contains_key(&id))
    }

    fn set_state(&self, id: ArtifactId, state: ArtifactState) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.state = state;
        }
    }

    async fn locate_produced_file(
        &self,
        id: ArtifactId,
        nominal: Option<&str>,
    ) -> std::io::Result<Option<(PathBuf, u64)>> {
        let mut candidates = files_with_prefix(&self.dir, id).await?;
        candidates.retain(|(path, _)| !is_partial(path));

        let nominal_name = nominal.and_then(|value| Path::new(value).file_name());
        if let Some(nominal_name) = nominal_name
            && let Some(found) = candidates
                .iter()
                .find(|(path, _)| path.file_name() == Some(nominal_name))
        {
            return Ok(Some(found.clone()));
        }

        candidates.sort_by_key(|(_, len)| Reverse(*len));
        Ok(candidates.into_iter().next())
    }

    /// Drops a failed fetch, including any partial output it left behind.
    async fn discard(&self, id: ArtifactId) {
        remove_partial_output(&self.dir, id).await;
        release(&self.records, id, ArtifactState::FetchFailed);
    }
}

/// Settles a fetch whose future was dropped before it reached `Ready`,
/// e.g. when the engine run is cancelled mid-download.
struct PendingFetch {
    dir: PathBuf,
    records: Arc<DashMap<ArtifactId, ArtifactRecord>>,
    id: ArtifactId,
    settled: bool,
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        warn!(id = %self.id, "fetch abandoned before completion");
        release(&self.records, self.id, ArtifactState::FetchFailed);

        let (dir, id) = (self.dir.clone(), self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { remove_partial_output(&dir, id).await });
            }
            Err(_) => warn!(%id, "no runtime left to remove partial output"),
        }
    }
}

async fn files_with_prefix(dir: &Path, id: ArtifactId) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let prefix = id.to_string();
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => return Err(error),
        };
        if metadata.is_file() {
            found.push((entry.path(), metadata.len()));
        }
    }

    Ok(found)
}

async fn remove_partial_output(dir: &Path, id: ArtifactId) {
    match files_with_prefix(dir, id).await {
        Ok(files) => {
            for (path, _) in files {
                remove_artifact_file(&path).await;
            }
        }
        Err(error) => warn!(%id, "could not scan for partial output: {error}"),
    }
}

fn release(records: &DashMap<ArtifactId, ArtifactRecord>, id: ArtifactId, terminal: ArtifactState) {
    if let Some((_, record)) = records.remove(&id) {
        debug!(%id, from = ?record.state, to = ?terminal, "artifact released");
    }
}

fn is_partial(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.ends_with(".part")
        || name.ends_with(".ytdl")
        || name.ends_with(".temp")
        || name.contains(".part-Frag")
}

/// Idempotent delete: a file that is already gone is not an error, and any
/// other failure is logged and swallowed. Returns whether a file was removed.
pub async fn remove_artifact_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => {
            warn!("could not delete artifact {:?}: {error}", path);
            false
        }
    }
}
