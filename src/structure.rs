use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Column data for a per-atom property. Multi-component properties (forces,
/// velocities) are stored flat, row-major, with `AtomArray::width` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayValues {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl ArrayValues {
    pub fn len(&self) -> usize {
        match self {
            ArrayValues::Float(values) => values.len(),
            ArrayValues::Int(values) => values.len(),
            ArrayValues::Bool(values) => values.len(),
            ArrayValues::Str(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomArray {
    pub width: usize,
    pub values: ArrayValues,
}

impl AtomArray {
    pub fn float(width: usize, values: Vec<f64>) -> Self {
        Self {
            width,
            values: ArrayValues::Float(values),
        }
    }

    /// Number of rows, i.e. atoms.
    pub fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.values.len() / self.width
        }
    }
}

/// Per-structure property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    FloatArray(Vec<f64>),
    IntArray(Vec<i64>),
}

impl InfoValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InfoValue::Float(value) => Some(*value),
            InfoValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }
}

/// One atomic configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub symbols: Vec<String>,
    pub positions: Vec<[f64; 3]>,
    #[serde(default)]
    pub cell: Option<[[f64; 3]; 3]>,
    #[serde(default)]
    pub pbc: [bool; 3],
    #[serde(default)]
    pub arrays: BTreeMap<String, AtomArray>,
    #[serde(default)]
    pub info: BTreeMap<String, InfoValue>,
}

impl Structure {
    pub fn new(symbols: Vec<String>, positions: Vec<[f64; 3]>) -> Self {
        Self {
            symbols,
            positions,
            cell: None,
            pbc: [false; 3],
            arrays: BTreeMap::new(),
            info: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn is_periodic(&self) -> bool {
        self.pbc.iter().any(|p| *p)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.arrays.contains_key(key) || self.info.contains_key(key)
    }

    /// Moves the value stored under `old` to `new`, overwriting anything
    /// already stored under `new` in the same map. Per-atom arrays are
    /// checked before per-structure info. Returns whether a field moved.
    pub fn rename_field(&mut self, old: &str, new: &str) -> bool {
        if old == new {
            return self.has_field(old);
        }
        if let Some(value) = self.arrays.remove(old) {
            self.arrays.insert(new.to_string(), value);
            return true;
        }
        if let Some(value) = self.info.remove(old) {
            self.info.insert(new.to_string(), value);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water() -> Structure {
        Structure::new(
            vec!["O".into(), "H".into(), "H".into()],
            vec![[0.0, 0.0, 0.0], [0.96, 0.0, 0.0], [-0.24, 0.93, 0.0]],
        )
    }

    #[test]
    fn rename_moves_info_value() {
        let mut s = water();
        s.info.insert("old".into(), InfoValue::Int(5));
        assert!(s.rename_field("old", "new"));
        assert_eq!(s.info.get("new"), Some(&InfoValue::Int(5)));
        assert!(!s.info.contains_key("old"));
    }

    #[test]
    fn rename_overwrites_existing_target() {
        let mut s = water();
        s.info.insert("old".into(), InfoValue::Int(5));
        s.info.insert("new".into(), InfoValue::Int(9));
        s.rename_field("old", "new");
        assert_eq!(s.info.get("new"), Some(&InfoValue::Int(5)));
        assert_eq!(s.info.len(), 1);
    }

    #[test]
    fn rename_prefers_per_atom_arrays() {
        let mut s = water();
        s.arrays
            .insert("F".into(), AtomArray::float(3, vec![0.0; 9]));
        assert!(s.rename_field("F", "forces"));
        assert_eq!(s.arrays["forces"].rows(), 3);
    }

    #[test]
    fn rename_missing_key_is_noop() {
        let mut s = water();
        assert!(!s.rename_field("absent", "new"));
        assert!(s.info.is_empty());
    }
}
