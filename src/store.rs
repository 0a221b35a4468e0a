use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use walkdir::WalkDir;

use crate::domain::{DatasetId, PACKAGE_VERSION};
use crate::error::LoadAtomsError;
use crate::storage::{CACHE_FORMAT_VERSION, StorageFormat};

const MARKER_NAME: &str = ".complete";

/// Paths under a cache root:
///
/// ```text
/// <root>/<id>.lock          advisory lock while a load is in flight
/// <root>/<id>/<id>.yaml     resolved description
/// <root>/<id>/raw/          downloads and intermediates
/// <root>/<id>/<id>.bin.gz  or <id>.sqlite, the materialised dataset
/// <root>/<id>/.complete     completion marker, written last
/// ```
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: Utf8PathBuf,
}

impl CacheLayout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn from_path(root: &Path) -> Result<Self, LoadAtomsError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|path| LoadAtomsError::Filesystem(format!("non UTF-8 cache root {}", path.display())))?;
        Ok(Self { root })
    }

    /// `~/.load-atoms`
    pub fn default_root() -> Result<Utf8PathBuf, LoadAtomsError> {
        BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".load-atoms")).ok())
            .ok_or_else(|| LoadAtomsError::Filesystem("unable to resolve home directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.root.join(id.as_str())
    }

    pub fn metadata_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join(format!("{id}.yaml"))
    }

    pub fn raw_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join("raw")
    }

    pub fn data_path(&self, id: &DatasetId, format: StorageFormat) -> Utf8PathBuf {
        self.dataset_dir(id).join(format!("{id}.{}", format.extension()))
    }

    pub fn marker_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join(MARKER_NAME)
    }

    pub fn lock_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.root.join(format!("{id}.lock"))
    }

    pub fn ensure_root(&self) -> Result<(), LoadAtomsError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))
    }

    /// The completion marker, if present and readable. An unreadable
    /// marker counts as absent.
    pub fn read_marker(&self, id: &DatasetId) -> Option<CompletionMarker> {
        let content = fs::read(self.marker_path(id).as_std_path()).ok()?;
        match serde_json::from_slice(&content) {
            Ok(marker) => Some(marker),
            Err(err) => {
                tracing::warn!(dataset = %id, error = %err, "ignoring unreadable completion marker");
                None
            }
        }
    }

    /// A marker that matches this build and points at an existing data file.
    pub fn valid_marker(&self, id: &DatasetId) -> Option<CompletionMarker> {
        let marker = self.read_marker(id)?;
        if marker.cache_format != CACHE_FORMAT_VERSION {
            tracing::info!(
                dataset = %id,
                found = marker.cache_format,
                expected = CACHE_FORMAT_VERSION,
                "cache layout changed, rebuilding"
            );
            return None;
        }
        if !self.dataset_dir(id).join(&marker.file).is_file() {
            tracing::warn!(dataset = %id, file = %marker.file, "marker points at a missing data file");
            return None;
        }
        Some(marker)
    }

    pub fn write_marker(&self, id: &DatasetId, marker: &CompletionMarker) -> Result<(), LoadAtomsError> {
        let content = serde_json::to_vec_pretty(marker)
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&self.marker_path(id), &content)
    }

    pub fn remove_marker(&self, id: &DatasetId) -> Result<(), LoadAtomsError> {
        remove_file_if_exists(self.marker_path(id).as_std_path())
    }

    /// Identifiers under the root that carry a completion marker.
    pub fn cached_ids(&self) -> Result<Vec<DatasetId>, LoadAtomsError> {
        if !self.root.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<DatasetId>() else {
                continue;
            };
            if entry.path().is_dir() && self.read_marker(&id).is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Takes the advisory lock for `id`. A lock file older than
    /// `stale_after` is assumed abandoned and taken over.
    pub fn acquire_lock(&self, id: &DatasetId, stale_after: Duration) -> Result<CacheLock, LoadAtomsError> {
        self.ensure_root()?;
        let path = self.lock_path(id).into_std_path_buf();
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(CacheLock { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let age = fs::metadata(&path)
                        .and_then(|meta| meta.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                    match age {
                        Some(age) if age >= stale_after => {
                            tracing::warn!(
                                dataset = %id,
                                age_secs = age.as_secs(),
                                "taking over stale cache lock"
                            );
                            remove_file_if_exists(&path)?;
                        }
                        _ => {
                            return Err(LoadAtomsError::CacheLocked {
                                dataset: id.to_string(),
                                lock: path,
                            });
                        }
                    }
                }
                Err(err) => return Err(LoadAtomsError::Filesystem(err.to_string())),
            }
        }
        Err(LoadAtomsError::CacheLocked {
            dataset: id.to_string(),
            lock: path,
        })
    }
}

/// Written as the last step of a successful load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub cache_format: u32,
    pub format: StorageFormat,
    /// Data file name, relative to the dataset directory.
    pub file: String,
    pub structures: usize,
    pub package_version: String,
    pub written_at: String,
}

impl CompletionMarker {
    pub fn new(format: StorageFormat, file: String, structures: usize) -> Self {
        Self {
            cache_format: CACHE_FORMAT_VERSION,
            format,
            file,
            structures,
            package_version: PACKAGE_VERSION.to_string(),
            written_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Held for the duration of a load; removes the lock file on drop.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(lock = %self.path.display(), error = %err, "failed to release cache lock");
            }
        }
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), LoadAtomsError> {
    let parent = path
        .parent()
        .ok_or_else(|| LoadAtomsError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn remove_file_if_exists(path: &Path) -> Result<(), LoadAtomsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LoadAtomsError::Filesystem(format!("remove {}: {err}", path.display()))),
    }
}

pub fn remove_dir_if_exists(path: &Path) -> Result<(), LoadAtomsError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LoadAtomsError::Filesystem(format!("remove {}: {err}", path.display()))),
    }
}

/// Every regular file below `root`, sorted by path. Symlinked files are
/// included; symlinked directories are not descended into.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, LoadAtomsError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| LoadAtomsError::Filesystem(format!("walk {}: {err}", root.display())))?;
        let is_file = entry.file_type().is_file()
            || (entry.path_is_symlink() && entry.path().is_file());
        if is_file {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn layout() -> (tempfile::TempDir, CacheLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::from_path(dir.path()).unwrap();
        (dir, layout)
    }

    #[test]
    fn layout_paths() {
        let (_dir, layout) = layout();
        let id: DatasetId = "C-GAP-17".parse().unwrap();
        assert!(layout.metadata_path(&id).ends_with("C-GAP-17/C-GAP-17.yaml"));
        assert!(layout.raw_dir(&id).ends_with("C-GAP-17/raw"));
        assert!(layout.data_path(&id, StorageFormat::Sqlite).ends_with("C-GAP-17/C-GAP-17.sqlite"));
        assert!(layout.lock_path(&id).ends_with("C-GAP-17.lock"));
    }

    #[test]
    fn marker_requires_data_file() {
        let (_dir, layout) = layout();
        let id: DatasetId = "QM7".parse().unwrap();
        let marker = CompletionMarker::new(StorageFormat::Memory, "QM7.bin.gz".into(), 3);
        layout.write_marker(&id, &marker).unwrap();
        assert_eq!(layout.read_marker(&id), Some(marker.clone()));
        assert!(layout.valid_marker(&id).is_none());

        fs::write(layout.data_path(&id, StorageFormat::Memory), b"x").unwrap();
        assert!(layout.valid_marker(&id).is_some());
        assert_eq!(layout.cached_ids().unwrap(), vec![id.clone()]);

        let mut stale = marker;
        stale.cache_format = CACHE_FORMAT_VERSION + 1;
        layout.write_marker(&id, &stale).unwrap();
        assert!(layout.valid_marker(&id).is_none());
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let (_dir, layout) = layout();
        let id: DatasetId = "QM7".parse().unwrap();
        let lock = layout.acquire_lock(&id, Duration::from_secs(3600)).unwrap();
        assert!(lock.path().exists());
        assert_matches!(
            layout.acquire_lock(&id, Duration::from_secs(3600)),
            Err(LoadAtomsError::CacheLocked { .. })
        );
        drop(lock);
        assert!(layout.acquire_lock(&id, Duration::from_secs(3600)).is_ok());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let (_dir, layout) = layout();
        let id: DatasetId = "QM7".parse().unwrap();
        let held = layout.acquire_lock(&id, Duration::from_secs(3600)).unwrap();
        let taken = layout.acquire_lock(&id, Duration::ZERO).unwrap();
        assert_eq!(held.path(), taken.path());
        std::mem::forget(held);
    }

    #[test]
    fn walk_files_is_sorted_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("c.xyz"), b"").unwrap();
        fs::write(dir.path().join("b/a.xyz"), b"").unwrap();
        fs::write(dir.path().join("a.xyz"), b"").unwrap();
        let names: Vec<_> = walk_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![PathBuf::from("a.xyz"), PathBuf::from("b/a.xyz"), PathBuf::from("c.xyz")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn walk_files_does_not_follow_directory_links() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.xyz"), b"").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("sub/a.xyz"), dir.path().join("b.xyz")).unwrap();

        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("b.xyz"), dir.path().join("sub/a.xyz")]);
    }
}
