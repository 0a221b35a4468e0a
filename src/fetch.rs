use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::checksum;
use crate::error::LoadAtomsError;
use crate::metadata::ManifestFile;
use crate::progress::{Phase, ProgressEvent, ProgressSink};

/// Retrieves the bytes behind a URL into a local file.
///
/// Implementations overwrite `destination`. Retries, if any, are their own
/// business; a returned error is final.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), LoadAtomsError>;
}

impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), LoadAtomsError> {
        (**self).fetch(url, destination)
    }
}

impl<T: Fetcher + ?Sized> Fetcher for &T {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), LoadAtomsError> {
        (**self).fetch(url, destination)
    }
}

/// HTTP(S) fetcher. `file://` URLs are copied from disk, which lets a
/// catalog mirror live on a shared filesystem.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, LoadAtomsError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("load-atoms/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| LoadAtomsError::Network {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, LoadAtomsError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(url, status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(url, attempt, error = %err, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(LoadAtomsError::Network {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), LoadAtomsError> {
        if let Some(local) = url.strip_prefix("file://") {
            let source = Path::new(local);
            if !source.exists() {
                return Err(LoadAtomsError::NetworkStatus {
                    url: url.to_string(),
                    status: 404,
                });
            }
            fs::copy(source, destination).map_err(|err| LoadAtomsError::Network {
                url: url.to_string(),
                message: err.to_string(),
            })?;
            return Ok(());
        }

        let mut response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            return Err(LoadAtomsError::NetworkStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let mut file = File::create(destination)
            .map_err(|err| LoadAtomsError::Filesystem(format!("{}: {err}", destination.display())))?;
        std::io::copy(&mut response, &mut file).map_err(|err| LoadAtomsError::Network {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Fetches `url` into a hidden temporary file inside `dir` and hands it back
/// unpromoted. Dropping the result deletes the file.
pub fn fetch_to_temp<F: Fetcher + ?Sized>(
    fetcher: &F,
    url: &str,
    dir: &Path,
) -> Result<tempfile::TempPath, LoadAtomsError> {
    fs::create_dir_all(dir).map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".part-")
        .tempfile_in(dir)
        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?
        .into_temp_path();
    fetcher.fetch(url, &temp)?;
    Ok(temp)
}

/// Ensures `file` is present in `dir` with the expected checksum.
///
/// A file already on disk that verifies is kept. Otherwise the download
/// lands in a temporary file and is only renamed to its manifest name once
/// it verifies, so an interrupted or corrupt transfer never occupies the
/// final path.
pub fn download_verified<F: Fetcher + ?Sized>(
    fetcher: &F,
    file: &ManifestFile,
    dir: &Path,
    sink: &dyn ProgressSink,
) -> Result<PathBuf, LoadAtomsError> {
    let destination = dir.join(&file.local_name);
    if destination.is_file() && checksum::matches_checksum(&destination, &file.checksum)? {
        tracing::debug!(file = %file.local_name, "already downloaded");
        return Ok(destination);
    }
    let parent = destination.parent().unwrap_or(dir);

    sink.event(ProgressEvent::new(Phase::Fetch, format!("downloading {}", file.local_name)));
    let start = Instant::now();
    let temp = fetch_to_temp(fetcher, &file.url, parent)?;
    tracing::info!(url = %file.url, latency_ms = start.elapsed().as_millis() as u64, "fetched");

    sink.event(ProgressEvent::new(Phase::Verify, format!("checking {}", file.local_name)));
    checksum::verify(&temp, &file.checksum, &file.local_name)?;

    temp.persist(&destination)
        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    sink.event(
        ProgressEvent::new(Phase::Fetch, format!("saved {}", file.local_name))
            .with_elapsed(start.elapsed()),
    );
    Ok(destination)
}

/// Downloads every manifest file into `dir` using up to `workers` threads.
///
/// Files are independent and land on disjoint paths. All must succeed; the
/// first failure in manifest order is returned.
pub fn download_all<F: Fetcher + ?Sized>(
    fetcher: &F,
    files: &[ManifestFile],
    dir: &Path,
    workers: usize,
    sink: &dyn ProgressSink,
) -> Result<Vec<PathBuf>, LoadAtomsError> {
    let workers = workers.clamp(1, files.len().max(1));
    if workers == 1 {
        return files
            .iter()
            .map(|file| download_verified(fetcher, file, dir, sink))
            .collect();
    }

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<Result<PathBuf, LoadAtomsError>>>> =
        Mutex::new((0..files.len()).map(|_| None).collect());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(file) = files.get(index) else {
                        break;
                    };
                    let result = download_verified(fetcher, file, dir, sink);
                    if let Ok(mut guard) = results.lock() {
                        guard[index] = Some(result);
                    }
                }
            });
        }
    });

    let results = results
        .into_inner()
        .map_err(|_| LoadAtomsError::Filesystem("download worker panicked".to_string()))?;
    let mut paths = Vec::with_capacity(files.len());
    let mut failures = Vec::new();
    for (file, result) in files.iter().zip(results) {
        match result {
            Some(Ok(path)) => paths.push(path),
            Some(Err(err)) => failures.push(err),
            None => failures.push(LoadAtomsError::Filesystem(format!(
                "download of {} did not complete",
                file.local_name
            ))),
        }
    }
    if failures.len() > 1 {
        tracing::warn!(count = failures.len(), "multiple downloads failed");
    }
    match failures.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(paths),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::progress::NoopSink;

    struct MapFetcher {
        files: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl Fetcher for MapFetcher {
        fn fetch(&self, url: &str, destination: &Path) -> Result<(), LoadAtomsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = self.files.get(url).ok_or(LoadAtomsError::NetworkStatus {
                url: url.to_string(),
                status: 404,
            })?;
            fs::write(destination, bytes).unwrap();
            Ok(())
        }
    }

    fn manifest(name: &str, contents: &str) -> ManifestFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::write(tmp.path(), contents).unwrap();
        ManifestFile {
            url: format!("https://example.org/{name}"),
            local_name: name.to_string(),
            checksum: checksum::generate_checksum(tmp.path()).unwrap(),
        }
    }

    fn fetcher(entries: &[(&str, &str)]) -> MapFetcher {
        MapFetcher {
            files: entries
                .iter()
                .map(|(name, contents)| (format!("https://example.org/{name}"), contents.as_bytes().to_vec()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn corrupt_download_never_reaches_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = manifest("a.xyz", "good");
        file.checksum = manifest("a.xyz", "other").checksum;
        let fetcher = fetcher(&[("a.xyz", "good")]);

        let err = download_verified(&fetcher, &file, dir.path(), &NoopSink).unwrap_err();
        assert_matches!(err, LoadAtomsError::Integrity { .. });
        assert!(!dir.path().join("a.xyz").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn verified_file_on_disk_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let file = manifest("a.xyz", "good");
        let fetcher = fetcher(&[("a.xyz", "good")]);

        download_verified(&fetcher, &file, dir.path(), &NoopSink).unwrap();
        download_verified(&fetcher, &file, dir.path(), &NoopSink).unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parallel_download_keeps_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            manifest("a.xyz", "a"),
            manifest("b.xyz", "b"),
            manifest("c.xyz", "c"),
        ];
        let fetcher = fetcher(&[("a.xyz", "a"), ("b.xyz", "b"), ("c.xyz", "c")]);

        let paths = download_all(&fetcher, &files, dir.path(), 8, &NoopSink).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.xyz", "b.xyz", "c.xyz"]);
    }

    #[test]
    fn one_failed_file_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![manifest("a.xyz", "a"), manifest("missing.xyz", "m")];
        let fetcher = fetcher(&[("a.xyz", "a")]);

        let err = download_all(&fetcher, &files, dir.path(), 2, &NoopSink).unwrap_err();
        assert_matches!(err, LoadAtomsError::NetworkStatus { status: 404, .. });
    }
}
