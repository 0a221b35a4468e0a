use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::cache::{CacheManager, CacheOptions, LoadSource};
use crate::config::Settings;
use crate::domain::DatasetId;
use crate::error::LoadAtomsError;
use crate::extxyz::{ExtXyzReader, StructureReader};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::metadata::{Catalog, MetadataResolver, license_url};
use crate::processing::{self, CustomRegistry, ProcessingContext, ProcessingStep};
use crate::progress::{self, Phase, ProgressEvent, ProgressSink};
use crate::storage::{Dataset, StorageFormat};
use crate::store::CacheLayout;
use crate::structure::Structure;

/// What to load.
#[derive(Debug, Clone)]
pub enum DatasetInput {
    /// A catalog identifier, resolved and cached under the root.
    Id(DatasetId),
    /// A local file or directory, read on every call and never cached.
    Path(PathBuf),
    /// Structures already in memory.
    Structures(Vec<Structure>),
}

impl DatasetInput {
    /// Interprets a command-line argument: an existing path wins, anything
    /// path-shaped that does not exist is an error, the rest is an id.
    pub fn parse(value: &str) -> Result<Self, LoadAtomsError> {
        let path = Path::new(value);
        if path.exists() {
            return Ok(DatasetInput::Path(path.to_path_buf()));
        }
        let path_like = value.contains('/')
            || value.contains('\\')
            || ExtXyzReader.can_read(path)
            || path.extension().is_some_and(|ext| ext == "zip");
        if path_like {
            return Err(LoadAtomsError::PathNotFound(path.to_path_buf()));
        }
        value.parse().map(DatasetInput::Id)
    }
}

impl From<DatasetId> for DatasetInput {
    fn from(id: DatasetId) -> Self {
        DatasetInput::Id(id)
    }
}

impl From<PathBuf> for DatasetInput {
    fn from(path: PathBuf) -> Self {
        DatasetInput::Path(path)
    }
}

impl From<&Path> for DatasetInput {
    fn from(path: &Path) -> Self {
        DatasetInput::Path(path.to_path_buf())
    }
}

impl From<Vec<Structure>> for DatasetInput {
    fn from(structures: Vec<Structure>) -> Self {
        DatasetInput::Structures(structures)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOrigin {
    Memory,
    Path,
    Cache,
    Built,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub dataset: Dataset,
    pub origin: LoadOrigin,
}

impl LoadOutcome {
    pub fn summary(&self, input: &str) -> Result<LoadSummary, LoadAtomsError> {
        Ok(LoadSummary {
            input: input.to_string(),
            origin: self.origin,
            storage: self.dataset.storage_format(),
            structures: self.dataset.len(),
            atoms: self.dataset.n_atoms(),
            per_atom_properties: self.dataset.array_keys()?.into_iter().collect(),
            per_structure_properties: self.dataset.info_keys()?.into_iter().collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub input: String,
    pub origin: LoadOrigin,
    pub storage: StorageFormat,
    pub structures: usize,
    pub atoms: usize,
    pub per_atom_properties: Vec<String>,
    pub per_structure_properties: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub root: String,
    pub datasets: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub format: StorageFormat,
    pub structures: usize,
    pub package_version: String,
    pub written_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub id: String,
    pub description: String,
    pub year: Option<u32>,
    pub category: Option<String>,
    pub license: Option<String>,
    pub license_url: Option<String>,
    pub citation: Option<String>,
    pub minimum_version: Option<String>,
    pub files: Vec<String>,
    pub processing: Vec<String>,
    pub declared_storage: Option<StorageFormat>,
    pub cached: bool,
    pub cached_structures: Option<usize>,
    pub url: String,
}

/// Entry point for loading datasets. Generic over the fetcher so tests can
/// serve catalog files from memory.
pub struct Loader<F: Fetcher = HttpFetcher> {
    settings: Settings,
    layout: CacheLayout,
    catalog: Catalog,
    fetcher: F,
    reader: Box<dyn StructureReader>,
    custom: CustomRegistry,
    sink: Box<dyn ProgressSink>,
    noticed: Mutex<HashSet<DatasetId>>,
}

impl Loader<HttpFetcher> {
    pub fn from_settings(settings: Settings) -> Result<Self, LoadAtomsError> {
        Loader::with_fetcher(settings, HttpFetcher::new()?)
    }
}

impl<F: Fetcher> Loader<F> {
    pub fn with_fetcher(settings: Settings, fetcher: F) -> Result<Self, LoadAtomsError> {
        let layout = CacheLayout::new(settings.root()?);
        let catalog = Catalog::new(settings.catalog_url.clone());
        let sink = progress::sink_for(settings.verbosity);
        Ok(Self {
            settings,
            layout,
            catalog,
            fetcher,
            reader: Box::new(ExtXyzReader),
            custom: CustomRegistry::new(),
            sink,
            noticed: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_reader(mut self, reader: Box<dyn StructureReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Registers a processor for `Custom` steps with this `id`.
    pub fn register_custom<P>(&mut self, id: impl Into<String>, processor: P)
    where
        P: Fn(&Path) -> Result<Vec<Structure>, LoadAtomsError> + Send + Sync + 'static,
    {
        self.custom.register(id, processor);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn load_dataset(&self, input: impl Into<DatasetInput>) -> Result<Dataset, LoadAtomsError> {
        self.load(input, false).map(|outcome| outcome.dataset)
    }

    pub fn load(&self, input: impl Into<DatasetInput>, force: bool) -> Result<LoadOutcome, LoadAtomsError> {
        match input.into() {
            DatasetInput::Structures(structures) => Ok(LoadOutcome {
                dataset: Dataset::from_structures(structures),
                origin: LoadOrigin::Memory,
            }),
            DatasetInput::Path(path) => self.load_path(&path).map(|dataset| LoadOutcome {
                dataset,
                origin: LoadOrigin::Path,
            }),
            DatasetInput::Id(id) => {
                let start = Instant::now();
                let options = self.cache_options();
                let manager = CacheManager {
                    fetcher: &self.fetcher,
                    catalog: &self.catalog,
                    layout: &self.layout,
                    reader: self.reader.as_ref(),
                    custom: &self.custom,
                    options: &options,
                };
                let (dataset, source) = manager.load(&id, force, self.sink.as_ref())?;
                tracing::info!(
                    dataset = %id,
                    structures = dataset.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "loaded"
                );
                self.emit_notice(&id, &dataset);
                let origin = match source {
                    LoadSource::Cache => LoadOrigin::Cache,
                    LoadSource::Built => LoadOrigin::Built,
                };
                Ok(LoadOutcome { dataset, origin })
            }
        }
    }

    /// Reads a local file or directory with the default chain.
    fn load_path(&self, path: &Path) -> Result<Dataset, LoadAtomsError> {
        if !path.exists() {
            return Err(LoadAtomsError::PathNotFound(path.to_path_buf()));
        }
        self.sink.event(ProgressEvent::new(
            Phase::Process,
            format!("reading {}", path.display()),
        ));
        let ctx = ProcessingContext {
            reader: self.reader.as_ref(),
            custom: &self.custom,
            sink: self.sink.as_ref(),
        };
        let structures = processing::run_chain(&ProcessingStep::default_chain(), path, &ctx)?;
        Ok(Dataset::from_structures(structures))
    }

    /// Resolves a dataset's description without downloading its files.
    pub fn info(&self, id: &DatasetId) -> Result<InfoResult, LoadAtomsError> {
        let resolver = MetadataResolver::new(&self.fetcher, &self.catalog, &self.layout);
        let record = resolver.resolve(id, self.sink.as_ref())?;
        let marker = self.layout.valid_marker(id);
        Ok(InfoResult {
            id: record.id.to_string(),
            description: record.description.clone(),
            year: record.year,
            category: record.category.clone(),
            license_url: record
                .license
                .as_deref()
                .and_then(license_url)
                .map(str::to_string),
            license: record.license.clone(),
            citation: record.citation.clone(),
            minimum_version: record.minimum_version.as_ref().map(|v| v.to_string()),
            files: record.files.iter().map(|f| f.local_name.clone()).collect(),
            processing: record.processing_chain().iter().map(|s| s.to_string()).collect(),
            declared_storage: record.storage,
            cached: marker.is_some(),
            cached_structures: marker.map(|m| m.structures),
            url: self.catalog.frontend_url(&record.id),
        })
    }

    /// Identifiers with a completed cache under the root.
    pub fn cached(&self) -> Result<Vec<DatasetId>, LoadAtomsError> {
        self.layout.cached_ids()
    }

    pub fn list(&self) -> Result<ListResult, LoadAtomsError> {
        self.sink
            .event(ProgressEvent::new(Phase::Resolve, format!("scanning {}", self.layout.root())));
        let datasets = self
            .cached()?
            .into_iter()
            .filter_map(|id| {
                let marker = self.layout.read_marker(&id)?;
                Some(ListEntry {
                    id: id.to_string(),
                    format: marker.format,
                    structures: marker.structures,
                    package_version: marker.package_version,
                    written_at: marker.written_at,
                })
            })
            .collect();
        Ok(ListResult {
            root: self.layout.root().to_string(),
            datasets,
        })
    }

    fn cache_options(&self) -> CacheOptions {
        self.settings.cache_options()
    }

    fn emit_notice(&self, id: &DatasetId, dataset: &Dataset) {
        if !self.settings.show_usage_notice {
            return;
        }
        let Some(record) = dataset.record() else {
            return;
        };
        let first = match self.noticed.lock() {
            Ok(mut noticed) => noticed.insert(id.clone()),
            Err(_) => false,
        };
        if first {
            for line in record.usage_notice(&self.catalog) {
                self.sink.notice(&line);
            }
        }
    }
}
