//! src/services/storage_service.rs
//!
//! StorageService writes uploaded images beneath `base_path/{folder}/{name}`
//! and reads them back. There is no metadata store: the directory tree is the
//! only record, and name uniqueness is enforced by the file system itself.
//!
//! Uploads go through two steps:
//! 1. `stage` streams the body into `base_path/.incoming/` under a random
//!    name, enforcing the size limit and fsyncing on completion.
//! 2. `commit` hard-links the staged file to the first free candidate name.
//!    `link(2)` fails with `EEXIST` when the name is taken, so the link is the
//!    collision check; a file never becomes visible under its public name
//!    before its contents are complete.

use crate::models::image::{ImageKind, StoredImage};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    fmt::Display,
    fs::Metadata,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Staging area for in-flight uploads. Never served.
pub const INCOMING_DIR: &str = ".incoming";
/// Folder used when an upload carries no `registro`.
pub const MISC_FOLDER: &str = "misc";
/// Name prefix used when an upload carries neither `registro` nor `ponto`.
pub const DEFAULT_PREFIX: &str = "upload";

const MAX_NAME_ATTEMPTS: u32 = 10_000;
const MAX_SEGMENT_LEN: usize = 128;
const MAX_RELATIVE_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file exceeds the {limit_mb} MB limit")]
    TooLarge { limit_mb: u64 },
    #[error("invalid name segment `{0}`")]
    InvalidSegment(String),
    #[error("invalid image path")]
    InvalidPath,
    #[error("image `{0}` not found")]
    NotFound(String),
    #[error("upload interrupted: {0}")]
    Interrupted(String),
    #[error("no free file name left for `{0}`")]
    NamesExhausted(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// An upload body fully written to the staging area.
///
/// Dropping a `StagedFile` that was never committed removes it.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    pub size_bytes: u64,
    pub etag: String,
    released: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(err) = fs::remove_file(&self.path).await {
            debug!("failed to unlink staged file {}: {}", self.path.display(), err);
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// How the final file name of an upload is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NameStem {
    /// Client asked for this name: `{name}.ext`, then `{name}-1.ext`, ...
    Requested(String),
    /// Generated: `{prefix}-1.ext`, `{prefix}-2.ext`, ...
    Sequential(String),
}

/// Folder plus candidate-name policy for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPlan {
    pub folder: String,
    stem: NameStem,
    kind: ImageKind,
}

impl NamingPlan {
    /// Build a plan from the optional `registro` (folder) and `ponto` (name).
    ///
    /// Both labels are sanitized; a label that sanitizes to nothing is
    /// rejected rather than silently replaced.
    pub fn new(registro: Option<&str>, ponto: Option<&str>, kind: ImageKind) -> StorageResult<Self> {
        let folder = match registro {
            Some(raw) => sanitize_segment(raw)?,
            None => MISC_FOLDER.to_string(),
        };

        let stem = match ponto {
            Some(raw) => {
                let name = sanitize_segment(strip_image_extension(raw))?;
                NameStem::Requested(name)
            }
            None => match registro {
                Some(_) => NameStem::Sequential(folder.clone()),
                None => NameStem::Sequential(DEFAULT_PREFIX.to_string()),
            },
        };

        Ok(Self { folder, stem, kind })
    }

    /// The `attempt`-th candidate file name, starting at 0.
    pub fn candidate(&self, attempt: u32) -> String {
        let ext = self.kind.extension();
        match &self.stem {
            NameStem::Requested(name) if attempt == 0 => format!("{}.{}", name, ext),
            NameStem::Requested(name) => format!("{}-{}.{}", name, attempt, ext),
            NameStem::Sequential(prefix) => format!("{}-{}.{}", prefix, attempt + 1, ext),
        }
    }
}

/// StorageService provides the file operations behind the upload API:
/// - Stage an upload body (size-limited, fsynced, hashed)
/// - Commit a staged body under a unique name
/// - Open a stored image for streaming
/// - Probe that the storage root is writable
#[derive(Clone, Debug)]
pub struct StorageService {
    /// Base directory on disk where images are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn incoming_dir(&self) -> PathBuf {
        self.base_path.join(INCOMING_DIR)
    }

    /// Create the storage root and staging directory.
    pub async fn ensure_layout(&self) -> StorageResult<()> {
        fs::create_dir_all(self.incoming_dir()).await?;
        Ok(())
    }

    /// Stream an upload body into the staging area.
    ///
    /// - Writes chunks incrementally, computing size and MD5.
    /// - Aborts with `TooLarge` as soon as `limit` bytes are exceeded.
    /// - Flushes and fsyncs before returning.
    ///
    /// On any failure the partial file is removed.
    pub async fn stage<S, E>(&self, stream: S, limit: u64) -> StorageResult<StagedFile>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let incoming = self.incoming_dir();
        fs::create_dir_all(&incoming).await?;

        // From here on the guard removes the file on every early return.
        let mut staged = StagedFile {
            path: incoming.join(format!("{}.part", Uuid::new_v4())),
            size_bytes: 0,
            etag: String::new(),
            released: false,
        };
        let mut file = File::create(&staged.path).await?;

        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = chunk_res.map_err(|err| StorageError::Interrupted(err.to_string()))?;
            staged.size_bytes += chunk.len() as u64;
            if staged.size_bytes > limit {
                return Err(StorageError::TooLarge {
                    limit_mb: limit / (1024 * 1024),
                });
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        staged.etag = format!("{:x}", digest.compute());
        debug!(
            "staged {} bytes at {}",
            staged.size_bytes,
            staged.path.display()
        );
        Ok(staged)
    }

    /// Publish a staged file under the first free name of `plan`.
    ///
    /// Each candidate is claimed with a hard link, which fails with
    /// `AlreadyExists` if another upload (in this or any other process) got
    /// there first; the next candidate is then tried.
    pub async fn commit(&self, staged: StagedFile, plan: &NamingPlan) -> StorageResult<StoredImage> {
        let dir = self.base_path.join(&plan.folder);
        fs::create_dir_all(&dir).await?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = plan.candidate(attempt);
            let target = dir.join(&file_name);
            match fs::hard_link(staged.path(), &target).await {
                Ok(()) => {
                    let image = StoredImage {
                        folder: plan.folder.clone(),
                        file_name,
                        kind: plan.kind,
                        size_bytes: staged.size_bytes,
                        etag: staged.etag.clone(),
                    };
                    staged.release().await;
                    return Ok(image);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!("name {} taken, trying next", target.display());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Err(StorageError::NamesExhausted(plan.candidate(0)))
    }

    /// Resolve a `/`-separated relative path to a file under the root.
    ///
    /// Rejects empty segments, `.`-prefixed segments (which also covers `..`
    /// and the staging area), backslashes and control characters.
    pub fn resolve(&self, relative: &str) -> StorageResult<PathBuf> {
        if relative.is_empty() || relative.len() > MAX_RELATIVE_PATH_LEN {
            return Err(StorageError::InvalidPath);
        }
        let mut path = self.base_path.clone();
        for segment in relative.split('/') {
            if segment.is_empty()
                || segment.starts_with('.')
                || segment
                    .chars()
                    .any(|c| c.is_control() || c == '\\' || c == ':')
            {
                return Err(StorageError::InvalidPath);
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Open a stored image for reading.
    ///
    /// Returns the file handle and its metadata, or `NotFound` if nothing
    /// regular exists at `relative`.
    pub async fn open(&self, relative: &str) -> StorageResult<(File, Metadata)> {
        let path = self.resolve(relative)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(relative.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(relative.to_string()));
        }
        Ok((file, metadata))
    }

    /// Best-effort write/read/delete round trip under the root.
    pub async fn probe_writable(&self) -> io::Result<()> {
        let probe = self.base_path.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"probe").await?;
        let read_back = fs::read(&probe).await;
        let removed = fs::remove_file(&probe).await;
        match read_back {
            Ok(bytes) if bytes == b"probe" => removed,
            Ok(_) => Err(io::Error::other("probe file content mismatch")),
            Err(err) => Err(err),
        }
    }
}

/// Keep ASCII alphanumerics, `-`, `_` and `.`; drop leading dots.
///
/// An input that reduces to nothing is an error.
pub fn sanitize_segment(raw: &str) -> StorageResult<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() || cleaned.len() > MAX_SEGMENT_LEN {
        return Err(StorageError::InvalidSegment(raw.to_string()));
    }
    Ok(cleaned.to_string())
}

/// `foto.jpg` → `foto`; names without an image extension pass through.
fn strip_image_extension(name: &str) -> &str {
    match name.trim().rsplit_once('.') {
        Some((stem, _)) if ImageKind::from_file_name(name.trim()).is_some() => stem,
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn chunks(data: &[u8]) -> impl Stream<Item = Result<Bytes, io::Error>> + use<> {
        let parts: Vec<Result<Bytes, io::Error>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(parts)
    }

    fn incoming_entries(service: &StorageService) -> usize {
        std::fs::read_dir(service.incoming_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn requested_names_are_suffixed_in_order() {
        let plan = NamingPlan::new(Some("batch1"), Some("foto"), ImageKind::Jpeg).unwrap();
        assert_eq!(plan.folder, "batch1");
        assert_eq!(plan.candidate(0), "foto.jpg");
        assert_eq!(plan.candidate(1), "foto-1.jpg");
        assert_eq!(plan.candidate(2), "foto-2.jpg");
    }

    #[test]
    fn generated_names_are_sequential() {
        let plan = NamingPlan::new(Some("42"), None, ImageKind::Png).unwrap();
        assert_eq!(plan.candidate(0), "42-1.png");
        assert_eq!(plan.candidate(4), "42-5.png");

        let plan = NamingPlan::new(None, None, ImageKind::Webp).unwrap();
        assert_eq!(plan.folder, MISC_FOLDER);
        assert_eq!(plan.candidate(0), "upload-1.webp");
    }

    #[test]
    fn requested_name_drops_its_own_extension() {
        let plan = NamingPlan::new(None, Some("foto.JPG"), ImageKind::Jpeg).unwrap();
        assert_eq!(plan.candidate(0), "foto.jpg");
    }

    #[test]
    fn segments_are_sanitized() {
        assert_eq!(sanitize_segment(" lote 7/ä ").unwrap(), "lote7");
        assert_eq!(sanitize_segment("..hidden").unwrap(), "hidden");
        assert!(sanitize_segment("../..").is_err());
        assert!(sanitize_segment("///").is_err());
    }

    #[test]
    fn resolve_rejects_traversal_and_hidden_paths() {
        let service = StorageService::new("/srv/imagens");
        assert!(service.resolve("batch1/foto.jpg").is_ok());
        for bad in ["", "../etc/passwd", "a//b.jpg", ".incoming/x.part", "a/.probe", "a\\b"] {
            assert!(service.resolve(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[tokio::test]
    async fn stage_and_commit_round_trip() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());
        let data = b"not really a jpeg, but bytes are bytes".to_vec();

        let staged = service.stage(chunks(&data), 1024).await.unwrap();
        assert_eq!(staged.size_bytes, data.len() as u64);
        let plan = NamingPlan::new(Some("batch1"), Some("foto"), ImageKind::Jpeg).unwrap();
        let image = service.commit(staged, &plan).await.unwrap();

        assert_eq!(image.relative_path(), "batch1/foto.jpg");
        assert_eq!(image.etag, format!("{:x}", md5::compute(&data)));
        let stored = std::fs::read(dir.path().join("batch1/foto.jpg")).unwrap();
        assert_eq!(stored, data);
        assert_eq!(incoming_entries(&service), 0);
    }

    #[tokio::test]
    async fn second_commit_with_same_name_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());
        let plan = NamingPlan::new(Some("batch1"), Some("foto"), ImageKind::Jpeg).unwrap();

        let first = service.stage(chunks(b"first"), 1024).await.unwrap();
        let first = service.commit(first, &plan).await.unwrap();
        let second = service.stage(chunks(b"second"), 1024).await.unwrap();
        let second = service.commit(second, &plan).await.unwrap();

        assert_eq!(first.relative_path(), "batch1/foto.jpg");
        assert_eq!(second.relative_path(), "batch1/foto-1.jpg");
        assert_eq!(std::fs::read(dir.path().join("batch1/foto.jpg")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn oversized_body_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());

        let err = service.stage(chunks(&[0u8; 64]), 32).await.unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { .. }));
        assert_eq!(incoming_entries(&service), 0);
    }

    #[tokio::test]
    async fn interrupted_stream_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = service.stage(body, 1024).await.unwrap_err();
        assert!(matches!(err, StorageError::Interrupted(_)));
        assert_eq!(incoming_entries(&service), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_never_share_a_name() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());
        let plan = NamingPlan::new(Some("batch1"), Some("foto"), ImageKind::Jpeg).unwrap();

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let service = service.clone();
            let plan = plan.clone();
            tasks.push(tokio::spawn(async move {
                let staged = service.stage(chunks(&[i; 100]), 1024).await?;
                service.commit(staged, &plan).await
            }));
        }

        let mut paths = HashSet::new();
        for task in tasks {
            let image = task.await.unwrap().unwrap();
            let bytes = std::fs::read(dir.path().join(image.relative_path())).unwrap();
            assert_eq!(bytes.len(), 100);
            assert!(bytes.iter().all(|b| *b == bytes[0]));
            paths.insert(image.relative_path());
        }
        assert_eq!(paths.len(), 16);
    }

    #[tokio::test]
    async fn open_reports_missing_files() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());
        std::fs::create_dir_all(dir.path().join("batch1")).unwrap();

        assert!(matches!(
            service.open("batch1/nothing.jpg").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(service.open("batch1").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn probe_succeeds_on_writable_root() {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path());
        service.probe_writable().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
