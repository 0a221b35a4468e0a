//! Dataset descriptions: the YAML record each catalog entry publishes, its
//! normalised form, and resolution from the local cache or the catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::checksum;
use crate::domain::{DatasetId, Version};
use crate::error::LoadAtomsError;
use crate::fetch::{self, Fetcher};
use crate::processing::ProcessingStep;
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::storage::StorageFormat;
use crate::store::CacheLayout;

pub const DEFAULT_CATALOG_URL: &str = "https://github.com/jla-gardner/load-atoms/raw/main/database/";
pub const FRONTEND_URL: &str = "https://jla-gardner.github.io/load-atoms/datasets/";

const LICENSE_URLS: &[(&str, &str)] = &[
    ("CC BY-NC-SA 4.0", "https://creativecommons.org/licenses/by-nc-sa/4.0/deed.en"),
    ("CC BY-NC 4.0", "https://creativecommons.org/licenses/by-nc/4.0/deed.en"),
    ("CC BY 4.0", "https://creativecommons.org/licenses/by/4.0/deed.en"),
    ("CC0", "https://creativecommons.org/publicdomain/zero/1.0/deed.en"),
    ("MIT", "https://opensource.org/licenses/MIT"),
    ("GPLv3", "https://www.gnu.org/licenses/gpl-3.0.html"),
];

const VALID_CATEGORIES: &[&str] = &["Benchmarks", "Potential Fitting", "Synthetic Data"];

pub fn license_url(license: &str) -> Option<&'static str> {
    LICENSE_URLS
        .iter()
        .find(|(name, _)| *name == license)
        .map(|(_, url)| *url)
}

/// One raw file a dataset needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub url: String,
    /// Relative path under the dataset's `raw/` directory.
    pub local_name: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PropertyDescription {
    #[serde(alias = "description")]
    pub desc: String,
    #[serde(default)]
    pub units: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub description: String,
    pub long_description: Option<String>,
    pub year: Option<u32>,
    pub category: Option<String>,
    pub minimum_version: Option<Version>,
    pub citation: Option<String>,
    pub license: Option<String>,
    /// Explicit storage choice, overriding the size heuristic.
    pub storage: Option<StorageFormat>,
    pub files: Vec<ManifestFile>,
    /// `None` means the default chain.
    pub processing: Option<Vec<ProcessingStep>>,
    pub representative_structure: Option<usize>,
    pub per_atom_properties: BTreeMap<String, PropertyDescription>,
    pub per_structure_properties: BTreeMap<String, PropertyDescription>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    name: String,
    description: String,
    #[serde(default)]
    long_description: Option<String>,
    #[serde(default)]
    year: Option<u32>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "schemaVersion", alias = "minimum_load_atoms_version")]
    minimum_version: Option<Value>,
    #[serde(default)]
    citation: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    format: Option<String>,
    files: RawFiles,
    #[serde(default)]
    url_root: Option<String>,
    #[serde(default)]
    processing: Option<Vec<Value>>,
    #[serde(default)]
    representative_structure: Option<usize>,
    #[serde(default)]
    per_atom_properties: Option<BTreeMap<String, PropertyDescription>>,
    #[serde(default)]
    per_structure_properties: Option<BTreeMap<String, PropertyDescription>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFiles {
    List(Vec<RawFileEntry>),
    Template {
        #[serde(default)]
        url_root: Option<String>,
        filenames: Vec<String>,
        hashes: Vec<String>,
    },
    Mapping(serde_yaml::Mapping),
}

#[derive(Debug, Deserialize)]
struct RawFileEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(alias = "checksum")]
    hash: String,
}

impl DatasetRecord {
    /// Parses description text. `catalog` supplies the file root for
    /// relative file names; `source_name` labels errors.
    pub fn from_yaml(text: &str, catalog: &Catalog, source_name: &str) -> Result<Self, LoadAtomsError> {
        let schema = |message: String| LoadAtomsError::Schema {
            source_name: source_name.to_string(),
            message,
        };
        let raw: RawRecord = serde_yaml::from_str(text).map_err(|err| schema(err.to_string()))?;

        let id: DatasetId = raw
            .name
            .parse()
            .map_err(|_| schema(format!("invalid dataset name {:?}", raw.name)))?;

        let minimum_version = match raw.minimum_version {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse().map_err(|_| schema(format!("invalid version {s:?}")))?),
            Some(Value::Number(n)) => {
                let s = n.to_string();
                Some(s.parse().map_err(|_| schema(format!("invalid version {s:?}")))?)
            }
            Some(other) => return Err(schema(format!("invalid version {other:?}"))),
        };

        if let Some(citation) = &raw.citation {
            let citation = citation.trim();
            if !(citation.starts_with('@') && citation.ends_with('}')) {
                return Err(schema("citation must be a BibTeX entry".to_string()));
            }
        }
        if let Some(license) = &raw.license {
            if license_url(license).is_none() {
                tracing::warn!(dataset = %id, license = %license, "unrecognised license");
            }
        }
        if let Some(category) = &raw.category {
            if !VALID_CATEGORIES.contains(&category.as_str()) {
                tracing::warn!(dataset = %id, category = %category, "unrecognised category");
            }
        }

        let storage = raw
            .format
            .as_deref()
            .map(str::parse::<StorageFormat>)
            .transpose()
            .map_err(schema)?;

        let default_root = raw
            .url_root
            .clone()
            .unwrap_or_else(|| catalog.file_root(&id));
        let files = normalise_files(raw.files, &default_root).map_err(schema)?;

        let processing = raw
            .processing
            .as_deref()
            .map(ProcessingStep::parse_chain)
            .transpose()?;

        Ok(Self {
            id,
            description: raw.description,
            long_description: raw.long_description,
            year: raw.year,
            category: raw.category,
            minimum_version,
            citation: raw.citation.map(|c| c.trim().to_string()),
            license: raw.license,
            storage,
            files,
            processing,
            representative_structure: raw.representative_structure,
            per_atom_properties: raw.per_atom_properties.unwrap_or_default(),
            per_structure_properties: raw.per_structure_properties.unwrap_or_default(),
        })
    }

    pub fn processing_chain(&self) -> Vec<ProcessingStep> {
        self.processing.clone().unwrap_or_else(ProcessingStep::default_chain)
    }

    /// Fails if this package predates the dataset's minimum version.
    pub fn check_version(&self, current: &Version) -> Result<(), LoadAtomsError> {
        match &self.minimum_version {
            Some(required) if required > current => Err(LoadAtomsError::IncompatibleVersion {
                dataset: self.id.to_string(),
                required: required.to_string(),
                current: current.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Declared properties absent from the parsed keys.
    pub fn missing_properties(
        &self,
        array_keys: &BTreeSet<String>,
        info_keys: &BTreeSet<String>,
    ) -> Vec<String> {
        let per_atom = self
            .per_atom_properties
            .keys()
            .filter(|key| !array_keys.contains(*key) && !is_builtin_array(key));
        let per_structure = self
            .per_structure_properties
            .keys()
            .filter(|key| !info_keys.contains(*key));
        per_atom.chain(per_structure).cloned().collect()
    }

    pub fn usage_notice(&self, catalog: &Catalog) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(license) = &self.license {
            match license_url(license) {
                Some(url) => lines.push(format!(
                    "The {} dataset is covered by the {license} license ({url}).",
                    self.id
                )),
                None => lines.push(format!("The {} dataset is covered by the {license} license.", self.id)),
            }
        }
        if self.citation.is_some() {
            lines.push(format!(
                "Please cite the {} dataset if you use it in your work.",
                self.id
            ));
        }
        lines.push(format!(
            "For more information about the {} dataset, visit {}",
            self.id,
            catalog.frontend_url(&self.id)
        ));
        lines
    }
}

fn is_builtin_array(key: &str) -> bool {
    matches!(key, "positions" | "numbers" | "symbols" | "species" | "pos")
}

fn normalise_files(files: RawFiles, default_root: &str) -> Result<Vec<ManifestFile>, String> {
    let entries: Vec<(String, String, String)> = match files {
        RawFiles::List(entries) => entries
            .into_iter()
            .map(|entry| {
                let (url, name) = match (entry.url, entry.name) {
                    (Some(url), Some(name)) => (join_url(default_root, &url), name),
                    (Some(url), None) => {
                        let name = url
                            .rsplit('/')
                            .next()
                            .filter(|n| !n.is_empty())
                            .ok_or_else(|| format!("cannot derive a file name from {url:?}"))?
                            .to_string();
                        (join_url(default_root, &url), name)
                    }
                    (None, Some(name)) => (join_url(default_root, &name), name),
                    (None, None) => return Err("file entry needs a `name` or `url`".to_string()),
                };
                Ok((url, name, entry.hash))
            })
            .collect::<Result<_, String>>()?,
        RawFiles::Template {
            url_root,
            filenames,
            hashes,
        } => {
            if filenames.len() != hashes.len() {
                return Err(format!(
                    "{} filenames but {} hashes",
                    filenames.len(),
                    hashes.len()
                ));
            }
            let root = url_root.unwrap_or_else(|| default_root.to_string());
            filenames
                .into_iter()
                .zip(hashes)
                .map(|(name, hash)| (join_url(&root, &name), name, hash))
                .collect()
        }
        RawFiles::Mapping(mapping) => mapping
            .into_iter()
            .map(|(name, hash)| {
                let name = name.as_str().ok_or("file names must be strings")?.to_string();
                let hash = match hash {
                    Value::String(s) => s,
                    other => return Err(format!("checksum for {name} must be a string, found {other:?}")),
                };
                Ok((join_url(default_root, &name), name, hash))
            })
            .collect::<Result<_, String>>()?,
    };

    if entries.is_empty() {
        return Err("`files` must list at least one file".to_string());
    }
    let mut seen = BTreeSet::new();
    let mut manifest = Vec::with_capacity(entries.len());
    for (url, local_name, checksum) in entries {
        if !is_safe_relative(&local_name) {
            return Err(format!("unsafe file name {local_name:?}"));
        }
        if !seen.insert(local_name.clone()) {
            return Err(format!("duplicate file name {local_name:?}"));
        }
        if !checksum::is_valid_checksum(&checksum) {
            return Err(format!("invalid checksum {checksum:?} for {local_name}"));
        }
        manifest.push(ManifestFile {
            url,
            local_name,
            checksum: checksum.to_ascii_lowercase(),
        });
    }
    Ok(manifest)
}

fn join_url(root: &str, name: &str) -> String {
    if name.contains("://") {
        return name.to_string();
    }
    if root.ends_with('/') {
        format!("{root}{name}")
    } else {
        format!("{root}/{name}")
    }
}

fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Where dataset descriptions and their files are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    base_url: String,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_URL)
    }
}

impl Catalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn metadata_url(&self, id: &DatasetId) -> String {
        format!("{}{id}/{id}.yaml", self.base_url)
    }

    pub fn file_root(&self, id: &DatasetId) -> String {
        format!("{}{id}/", self.base_url)
    }

    pub fn frontend_url(&self, id: &DatasetId) -> String {
        format!("{FRONTEND_URL}{id}.html")
    }
}

/// Finds a dataset's description: the copy under the cache root if there
/// is one, otherwise the catalog's.
pub struct MetadataResolver<'a, F: Fetcher + ?Sized> {
    fetcher: &'a F,
    catalog: &'a Catalog,
    layout: &'a CacheLayout,
}

impl<'a, F: Fetcher + ?Sized> MetadataResolver<'a, F> {
    pub fn new(fetcher: &'a F, catalog: &'a Catalog, layout: &'a CacheLayout) -> Self {
        Self {
            fetcher,
            catalog,
            layout,
        }
    }

    pub fn resolve(&self, id: &DatasetId, sink: &dyn ProgressSink) -> Result<DatasetRecord, LoadAtomsError> {
        if let Some(record) = self.resolve_local(id)? {
            record.check_version(&Version::current())?;
            return Ok(record);
        }

        let url = self.catalog.metadata_url(id);
        sink.event(ProgressEvent::new(Phase::Resolve, format!("fetching description of {id}")));
        tracing::info!(dataset = %id, url = %url, "fetching dataset description");
        fs::create_dir_all(self.layout.root())
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        let temp = fetch::fetch_to_temp(self.fetcher, &url, self.layout.root().as_std_path())
            .map_err(|err| match err {
                LoadAtomsError::NetworkStatus { status: 404 | 410, .. } => {
                    LoadAtomsError::NotFound(id.to_string())
                }
                other => other,
            })?;
        let text = fs::read_to_string(&temp)
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        let record = self.parse(id, &text, &url)?;
        record.check_version(&Version::current())?;

        let destination = self.layout.metadata_path(id);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        }
        temp.persist(&destination)
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        Ok(record)
    }

    /// The cached description, without any network access. The version
    /// gate is the caller's business.
    pub fn resolve_local(&self, id: &DatasetId) -> Result<Option<DatasetRecord>, LoadAtomsError> {
        let path = self.layout.metadata_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        tracing::debug!(dataset = %id, path = %path, "using cached description");
        let text = fs::read_to_string(&path)
            .map_err(|err| LoadAtomsError::Filesystem(format!("read {path}: {err}")))?;
        self.parse(id, &text, path.as_str()).map(Some)
    }

    fn parse(&self, id: &DatasetId, text: &str, source_name: &str) -> Result<DatasetRecord, LoadAtomsError> {
        let record = DatasetRecord::from_yaml(text, self.catalog, source_name)?;
        if &record.id != id {
            return Err(LoadAtomsError::Schema {
                source_name: source_name.to_string(),
                message: format!("describes {} but {id} was requested", record.id),
            });
        }
        Ok(record)
    }
}

/// Parses a description file from disk against the default catalog.
pub fn read_record(path: &Path) -> Result<DatasetRecord, LoadAtomsError> {
    let text = fs::read_to_string(path)
        .map_err(|err| LoadAtomsError::Filesystem(format!("read {}: {err}", path.display())))?;
    DatasetRecord::from_yaml(&text, &Catalog::default(), &path.display().to_string())
}
