use std::collections::BTreeSet;
use std::fs;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::{DatasetId, Version};
use crate::error::LoadAtomsError;
use crate::extxyz::StructureReader;
use crate::fetch::{self, Fetcher};
use crate::metadata::{Catalog, DatasetRecord, MetadataResolver};
use crate::processing::{self, CustomRegistry, ProcessingContext};
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::storage::{self, Dataset, SizeThresholds, StorageChoice, StorageFormat, StructureSet};
use crate::store::{self, CacheLayout, CompletionMarker};
use crate::structure::Structure;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub storage: StorageChoice,
    pub thresholds: SizeThresholds,
    pub fetch_workers: usize,
    pub lock_stale_after: Duration,
    /// Keep `raw/` after a successful build.
    pub keep_raw: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            storage: StorageChoice::Auto,
            thresholds: SizeThresholds::default(),
            fetch_workers: 8,
            lock_stale_after: Duration::from_secs(3600),
            keep_raw: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Cache,
    Built,
}

/// Materialises catalog datasets under a cache root.
///
/// A dataset counts as cached only once its completion marker exists; the
/// marker is written after the data file is in place, so an interrupted
/// build is simply rebuilt next time.
pub struct CacheManager<'a, F: Fetcher + ?Sized> {
    pub fetcher: &'a F,
    pub catalog: &'a Catalog,
    pub layout: &'a CacheLayout,
    pub reader: &'a dyn StructureReader,
    pub custom: &'a CustomRegistry,
    pub options: &'a CacheOptions,
}

impl<F: Fetcher + ?Sized> CacheManager<'_, F> {
    pub fn load(
        &self,
        id: &DatasetId,
        force: bool,
        sink: &dyn ProgressSink,
    ) -> Result<(Dataset, LoadSource), LoadAtomsError> {
        if !force {
            if let Some(dataset) = self.load_cached(id, sink)? {
                return Ok((dataset, LoadSource::Cache));
            }
        }

        // the lock guards building only; re-check once held in case another
        // process just finished
        let _lock = self.layout.acquire_lock(id, self.options.lock_stale_after)?;
        if !force {
            if let Some(dataset) = self.load_cached(id, sink)? {
                return Ok((dataset, LoadSource::Cache));
            }
        }
        self.build(id, sink).map(|dataset| (dataset, LoadSource::Built))
    }

    fn resolver(&self) -> MetadataResolver<'_, F> {
        MetadataResolver::new(self.fetcher, self.catalog, self.layout)
    }

    fn load_cached(&self, id: &DatasetId, sink: &dyn ProgressSink) -> Result<Option<Dataset>, LoadAtomsError> {
        let Some(marker) = self.layout.valid_marker(id) else {
            return Ok(None);
        };
        let record = match self.resolver().resolve_local(id) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(dataset = %id, error = %err, "cached description unreadable, rebuilding");
                return Ok(None);
            }
        };
        if let Some(record) = &record {
            record.check_version(&Version::current())?;
        }

        let path = self.layout.dataset_dir(id).join(&marker.file);
        let start = Instant::now();
        let set = match marker.format.backend().open(path.as_std_path()) {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!(dataset = %id, error = %err, "cached data unreadable, rebuilding");
                return Ok(None);
            }
        };
        tracing::info!(dataset = %id, format = %marker.format, "cache hit");
        sink.event(
            ProgressEvent::new(Phase::Store, format!("loaded {id} from cache"))
                .with_elapsed(start.elapsed()),
        );
        Ok(Some(Dataset::new(set, record)))
    }

    fn build(&self, id: &DatasetId, sink: &dyn ProgressSink) -> Result<Dataset, LoadAtomsError> {
        let record = self.resolver().resolve(id, sink)?;
        let raw_dir = self.layout.raw_dir(id);

        sink.event(ProgressEvent::new(
            Phase::Fetch,
            format!("{} file(s) for {id}", record.files.len()),
        ));
        // verified files survive a failed fetch and are reused on retry
        fetch::download_all(
            self.fetcher,
            &record.files,
            raw_dir.as_std_path(),
            self.options.fetch_workers,
            sink,
        )?;

        let structures = match self.process(&record, sink) {
            Ok(structures) => structures,
            Err(err) => {
                if !self.options.keep_raw {
                    store::remove_dir_if_exists(raw_dir.as_std_path())?;
                }
                return Err(err);
            }
        };
        warn_on_missing_properties(&record, &structures);

        let format = storage::choose_format(
            self.options.storage,
            record.storage,
            &structures,
            self.options.thresholds,
        );
        self.persist(id, format, &structures, sink)?;

        if !self.options.keep_raw {
            store::remove_dir_if_exists(raw_dir.as_std_path())?;
        }

        let set = match format {
            StorageFormat::Memory => StructureSet::Memory(structures),
            StorageFormat::Sqlite => format
                .backend()
                .open(self.layout.data_path(id, format).as_std_path())?,
        };
        Ok(Dataset::new(set, Some(record)))
    }

    fn process(&self, record: &DatasetRecord, sink: &dyn ProgressSink) -> Result<Vec<Structure>, LoadAtomsError> {
        let chain = record.processing_chain();
        let start = Instant::now();
        sink.event(ProgressEvent::new(
            Phase::Process,
            format!("running {} processing step(s)", chain.len()),
        ));
        let ctx = ProcessingContext {
            reader: self.reader,
            custom: self.custom,
            sink,
        };
        let structures = processing::run_chain(&chain, self.layout.raw_dir(&record.id).as_std_path(), &ctx)?;
        tracing::info!(
            dataset = %record.id,
            structures = structures.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "processed"
        );
        Ok(structures)
    }

    /// Writes the data file beside any previous one and swaps it in. The
    /// old marker is removed before the swap and the new one written last.
    fn persist(
        &self,
        id: &DatasetId,
        format: StorageFormat,
        structures: &[Structure],
        sink: &dyn ProgressSink,
    ) -> Result<(), LoadAtomsError> {
        let start = Instant::now();
        let dir = self.layout.dataset_dir(id);
        fs::create_dir_all(dir.as_std_path()).map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;

        let temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(dir.as_std_path())
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?
            .into_temp_path();
        format.backend().write(&temp, structures)?;

        self.layout.remove_marker(id)?;
        let data_path = self.layout.data_path(id, format);
        temp.persist(data_path.as_std_path())
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        for other in [StorageFormat::Memory, StorageFormat::Sqlite] {
            if other != format {
                store::remove_file_if_exists(self.layout.data_path(id, other).as_std_path())?;
            }
        }

        let file = data_path
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{id}.{}", format.extension()));
        self.layout
            .write_marker(id, &CompletionMarker::new(format, file, structures.len()))?;

        tracing::info!(dataset = %id, format = %format, structures = structures.len(), "persisted");
        sink.event(
            ProgressEvent::new(Phase::Store, format!("saved {} structures ({format})", structures.len()))
                .with_elapsed(start.elapsed()),
        );
        Ok(())
    }
}

fn warn_on_missing_properties(record: &DatasetRecord, structures: &[Structure]) {
    let mut arrays = BTreeSet::new();
    let mut info = BTreeSet::new();
    for structure in structures {
        arrays.extend(structure.arrays.keys().cloned());
        info.extend(structure.info.keys().cloned());
    }
    let missing = record.missing_properties(&arrays, &info);
    if !missing.is_empty() {
        tracing::warn!(
            dataset = %record.id,
            missing = ?missing,
            "declared properties not found in processed structures"
        );
    }
}
