//! Durable structure stores and the dataset handle served from them.
//!
//! Small datasets are kept as one gzipped bincode blob that is read fully
//! into memory. Large ones go into an SQLite file with one bincode row per
//! structure and are read lazily. Floats are stored bit-for-bit, NaN included.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::LoadAtomsError;
use crate::metadata::DatasetRecord;
use crate::structure::Structure;

/// Bumped whenever the persisted layout changes; older caches are rebuilt.
pub const CACHE_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    Memory,
    Sqlite,
}

impl StorageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            StorageFormat::Memory => "bin.gz",
            StorageFormat::Sqlite => "sqlite",
        }
    }

    pub fn backend(self) -> &'static dyn DurableStore {
        match self {
            StorageFormat::Memory => &BlobStore,
            StorageFormat::Sqlite => &SqliteStore,
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            StorageFormat::Memory => "memory",
            StorageFormat::Sqlite => "sqlite",
        })
    }
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageFormat::Memory),
            // datasets published for an LMDB-backed store
            "sqlite" | "lmdb" => Ok(StorageFormat::Sqlite),
            other => Err(format!("unknown storage format {other:?} (expected memory or sqlite)")),
        }
    }
}

/// User-level storage preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageChoice {
    #[default]
    Auto,
    Memory,
    Sqlite,
}

impl FromStr for StorageChoice {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(StorageChoice::Auto),
            other => other.parse::<StorageFormat>().map(|format| match format {
                StorageFormat::Memory => StorageChoice::Memory,
                StorageFormat::Sqlite => StorageChoice::Sqlite,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeThresholds {
    pub structures: usize,
    pub atoms: usize,
}

impl Default for SizeThresholds {
    fn default() -> Self {
        Self {
            structures: 100_000,
            atoms: 5_000_000,
        }
    }
}

/// Settings beat the dataset's declared format, which beats the size heuristic.
pub fn choose_format(
    choice: StorageChoice,
    declared: Option<StorageFormat>,
    structures: &[Structure],
    thresholds: SizeThresholds,
) -> StorageFormat {
    match choice {
        StorageChoice::Memory => return StorageFormat::Memory,
        StorageChoice::Sqlite => return StorageFormat::Sqlite,
        StorageChoice::Auto => {}
    }
    if let Some(format) = declared {
        return format;
    }
    let atoms: usize = structures.iter().map(Structure::len).sum();
    if structures.len() > thresholds.structures || atoms > thresholds.atoms {
        StorageFormat::Sqlite
    } else {
        StorageFormat::Memory
    }
}

/// One way of persisting a structure sequence to a single file.
pub trait DurableStore: Send + Sync {
    fn format(&self) -> StorageFormat;

    /// Writes `structures` to `path`, replacing its contents.
    fn write(&self, path: &Path, structures: &[Structure]) -> Result<(), LoadAtomsError>;

    fn open(&self, path: &Path) -> Result<StructureSet, LoadAtomsError>;
}

pub struct BlobStore;

impl DurableStore for BlobStore {
    fn format(&self) -> StorageFormat {
        StorageFormat::Memory
    }

    fn write(&self, path: &Path, structures: &[Structure]) -> Result<(), LoadAtomsError> {
        let file = File::create(path).map_err(|err| storage_io(path, err))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
        bincode::serialize_into(&mut encoder, structures)
            .map_err(|err| LoadAtomsError::Storage(format!("serialize {}: {err}", path.display())))?;
        encoder
            .finish()
            .and_then(|mut inner| inner.flush())
            .map_err(|err| storage_io(path, err))?;
        Ok(())
    }

    fn open(&self, path: &Path) -> Result<StructureSet, LoadAtomsError> {
        let file = File::open(path).map_err(|err| storage_io(path, err))?;
        let structures: Vec<Structure> = bincode::deserialize_from(BufReader::new(GzDecoder::new(file)))
            .map_err(|err| LoadAtomsError::Storage(format!("read {}: {err}", path.display())))?;
        Ok(StructureSet::Memory(structures))
    }
}

pub struct SqliteStore;

impl DurableStore for SqliteStore {
    fn format(&self) -> StorageFormat {
        StorageFormat::Sqlite
    }

    fn write(&self, path: &Path, structures: &[Structure]) -> Result<(), LoadAtomsError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "
            DROP TABLE IF EXISTS structures;
            DROP TABLE IF EXISTS metadata;
            CREATE TABLE structures (
                idx INTEGER PRIMARY KEY,
                n_atoms INTEGER NOT NULL,
                data BLOB NOT NULL
            );
            CREATE TABLE metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO structures (idx, n_atoms, data) VALUES (?1, ?2, ?3)")?;
            for (idx, structure) in structures.iter().enumerate() {
                let data = bincode::serialize(structure)
                    .map_err(|err| LoadAtomsError::Storage(err.to_string()))?;
                stmt.execute(params![idx as i64, structure.len() as i64, data])?;
            }
            tx.execute(
                "INSERT INTO metadata (key, value) VALUES ('cache_format', ?1), ('structures', ?2)",
                params![CACHE_FORMAT_VERSION.to_string(), structures.len().to_string()],
            )?;
        }
        tx.commit()?;
        tracing::debug!(path = %path.display(), count = structures.len(), "wrote sqlite store");
        Ok(())
    }

    fn open(&self, path: &Path) -> Result<StructureSet, LoadAtomsError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let sizes = {
            let mut stmt = conn.prepare("SELECT n_atoms FROM structures ORDER BY idx ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            rows.map(|row| row.map(|n| n as usize))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(StructureSet::Sqlite(SqliteSet {
            conn: Mutex::new(conn),
            sizes,
        }))
    }
}

fn storage_io(path: &Path, err: std::io::Error) -> LoadAtomsError {
    LoadAtomsError::Storage(format!("{}: {err}", path.display()))
}

pub struct SqliteSet {
    conn: Mutex<Connection>,
    sizes: Vec<usize>,
}

impl SqliteSet {
    fn get(&self, index: usize) -> Result<Option<Structure>, LoadAtomsError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| LoadAtomsError::Storage("connection lock poisoned".to_string()))?;
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM structures WHERE idx = ?1",
                params![index as i64],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|bytes| {
            bincode::deserialize(&bytes)
                .map_err(|err| LoadAtomsError::Storage(format!("structure {index}: {err}")))
        })
        .transpose()
    }
}

/// The structures behind a [`Dataset`].
pub enum StructureSet {
    Memory(Vec<Structure>),
    Sqlite(SqliteSet),
}

impl fmt::Debug for StructureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructureSet::Memory(s) => write!(f, "Memory({} structures)", s.len()),
            StructureSet::Sqlite(s) => write!(f, "Sqlite({} structures)", s.sizes.len()),
        }
    }
}

/// A loaded dataset. Cheap to clone; sqlite-backed datasets read
/// structures on demand.
#[derive(Debug, Clone)]
pub struct Dataset {
    set: Arc<StructureSet>,
    record: Option<Arc<DatasetRecord>>,
}

impl Dataset {
    pub fn from_structures(structures: Vec<Structure>) -> Self {
        Self::new(StructureSet::Memory(structures), None)
    }

    pub fn new(set: StructureSet, record: Option<DatasetRecord>) -> Self {
        let dataset = Self {
            set: Arc::new(set),
            record: record.map(Arc::new),
        };
        if dataset.len() == 1 {
            tracing::warn!(
                "dataset contains a single structure; access it with `get(0)` rather than iterating"
            );
        }
        dataset
    }

    pub fn len(&self) -> usize {
        match self.set.as_ref() {
            StructureSet::Memory(structures) => structures.len(),
            StructureSet::Sqlite(set) => set.sizes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Ok(None)` when `index` is out of range.
    pub fn get(&self, index: usize) -> Result<Option<Structure>, LoadAtomsError> {
        match self.set.as_ref() {
            StructureSet::Memory(structures) => Ok(structures.get(index).cloned()),
            StructureSet::Sqlite(set) => set.get(index),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Structure, LoadAtomsError>> + '_ {
        (0..self.len()).map(move |index| {
            self.get(index)?
                .ok_or_else(|| LoadAtomsError::Storage(format!("structure {index} missing from store")))
        })
    }

    pub fn to_vec(&self) -> Result<Vec<Structure>, LoadAtomsError> {
        self.iter().collect()
    }

    /// Atom count of every structure, in order.
    pub fn structure_sizes(&self) -> Vec<usize> {
        match self.set.as_ref() {
            StructureSet::Memory(structures) => structures.iter().map(Structure::len).collect(),
            StructureSet::Sqlite(set) => set.sizes.clone(),
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.structure_sizes().iter().sum()
    }

    /// Union of per-structure keys over the whole dataset.
    pub fn info_keys(&self) -> Result<BTreeSet<String>, LoadAtomsError> {
        let mut keys = BTreeSet::new();
        for structure in self.iter() {
            keys.extend(structure?.info.into_keys());
        }
        Ok(keys)
    }

    /// Union of per-atom keys over the whole dataset.
    pub fn array_keys(&self) -> Result<BTreeSet<String>, LoadAtomsError> {
        let mut keys = BTreeSet::new();
        for structure in self.iter() {
            keys.extend(structure?.arrays.into_keys());
        }
        Ok(keys)
    }

    pub fn record(&self) -> Option<&DatasetRecord> {
        self.record.as_deref()
    }

    pub fn storage_format(&self) -> StorageFormat {
        match self.set.as_ref() {
            StructureSet::Memory(_) => StorageFormat::Memory,
            StructureSet::Sqlite(_) => StorageFormat::Sqlite,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::structure::{ArrayValues, AtomArray, InfoValue};

    fn sample(n: usize) -> Vec<Structure> {
        (0..n)
            .map(|i| {
                let mut s = Structure::new(vec!["C".into(); i + 1], vec![[0.1 * i as f64, 1.0 / 3.0, -2.5]; i + 1]);
                s.info.insert("energy".into(), InfoValue::Float(-1.0 - i as f64 / 7.0));
                s.arrays
                    .insert("forces".into(), AtomArray::float(3, vec![0.3; 3 * (i + 1)]));
                s
            })
            .collect()
    }

    #[test]
    fn both_backings_preserve_structures_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let structures = sample(4);
        for format in [StorageFormat::Memory, StorageFormat::Sqlite] {
            let path = dir.path().join(format!("data.{}", format.extension()));
            format.backend().write(&path, &structures).unwrap();
            let dataset = Dataset::new(format.backend().open(&path).unwrap(), None);
            assert_eq!(dataset.storage_format(), format);
            assert_eq!(dataset.len(), 4);
            assert_eq!(dataset.structure_sizes(), vec![1, 2, 3, 4]);
            assert_eq!(dataset.n_atoms(), 10);
            assert_eq!(dataset.to_vec().unwrap(), structures);
            assert!(dataset.get(4).unwrap().is_none());
        }
    }

    #[test]
    fn non_finite_floats_survive_both_backings() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Structure::new(vec!["H".into()], vec![[0.0, f64::INFINITY, -0.0]]);
        s.info.insert("energy".into(), InfoValue::Float(f64::NAN));
        s.info
            .insert("stress".into(), InfoValue::FloatArray(vec![f64::NEG_INFINITY, 1.0]));
        s.arrays.insert("forces".into(), AtomArray::float(3, vec![f64::NAN, 0.0, 0.0]));
        for format in [StorageFormat::Memory, StorageFormat::Sqlite] {
            let path = dir.path().join(format!("nan.{}", format.extension()));
            format.backend().write(&path, std::slice::from_ref(&s)).unwrap();
            let back = Dataset::new(format.backend().open(&path).unwrap(), None)
                .get(0)
                .unwrap()
                .unwrap();
            assert_matches!(back.info["energy"], InfoValue::Float(e) if e.is_nan());
            assert_eq!(back.info["stress"], InfoValue::FloatArray(vec![f64::NEG_INFINITY, 1.0]));
            assert_eq!(back.positions[0][1], f64::INFINITY);
            assert!(back.positions[0][2].is_sign_negative());
            match &back.arrays["forces"].values {
                ArrayValues::Float(v) => assert!(v[0].is_nan()),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn key_unions() {
        let mut structures = sample(2);
        structures[1].info.insert("stress".into(), InfoValue::FloatArray(vec![0.0; 6]));
        let dataset = Dataset::from_structures(structures);
        let info: Vec<_> = dataset.info_keys().unwrap().into_iter().collect();
        assert_eq!(info, vec!["energy", "stress"]);
        assert!(dataset.array_keys().unwrap().contains("forces"));
    }

    #[test]
    fn format_selection_priority() {
        let small = sample(2);
        let tiny = SizeThresholds {
            structures: 1,
            atoms: 1_000,
        };
        assert_eq!(
            choose_format(StorageChoice::Auto, None, &small, SizeThresholds::default()),
            StorageFormat::Memory
        );
        assert_eq!(choose_format(StorageChoice::Auto, None, &small, tiny), StorageFormat::Sqlite);
        assert_eq!(
            choose_format(StorageChoice::Auto, Some(StorageFormat::Memory), &small, tiny),
            StorageFormat::Memory
        );
        assert_eq!(
            choose_format(StorageChoice::Sqlite, Some(StorageFormat::Memory), &small, tiny),
            StorageFormat::Sqlite
        );
    }

    #[test]
    fn parses_storage_names() {
        assert_eq!("lmdb".parse::<StorageFormat>().unwrap(), StorageFormat::Sqlite);
        assert_eq!("AUTO".parse::<StorageChoice>().unwrap(), StorageChoice::Auto);
        assert!("parquet".parse::<StorageChoice>().is_err());
    }
}
