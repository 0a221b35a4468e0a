//! Extended XYZ reading and writing.
//!
//! Each frame is an atom-count line, a comment line of `key=value` pairs
//! (with `Lattice`, `pbc` and `Properties` given special meaning) and one
//! line per atom whose columns are described by `Properties`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::LoadAtomsError;
use crate::structure::{ArrayValues, AtomArray, InfoValue, Structure};

const DEFAULT_PROPERTIES: &str = "species:S:1:pos:R:3";
const RESERVED_KEYS: &[&str] = &["Lattice", "pbc", "Properties"];

/// The structure-parsing capability used by the processing chain.
pub trait StructureReader: Send + Sync {
    /// Whether `path` looks like a file this reader understands.
    fn can_read(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> Result<Vec<Structure>, LoadAtomsError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtXyzReader;

impl StructureReader for ExtXyzReader {
    fn can_read(&self, path: &Path) -> bool {
        let name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_ascii_lowercase(),
            None => return false,
        };
        [".xyz", ".extxyz", ".xyz.gz", ".extxyz.gz"]
            .iter()
            .any(|ext| name.ends_with(ext))
    }

    fn read(&self, path: &Path) -> Result<Vec<Structure>, LoadAtomsError> {
        let file = File::open(path).map_err(|err| LoadAtomsError::Parse {
            path: path.to_path_buf(),
            line: 0,
            message: err.to_string(),
        })?;
        let is_gz = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);
        let reader: Box<dyn Read> = if is_gz {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        read_frames(BufReader::new(reader), path)
    }
}

pub fn read_frames<R: BufRead>(reader: R, path: &Path) -> Result<Vec<Structure>, LoadAtomsError> {
    let parse_err = |line: usize, message: String| LoadAtomsError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut lines = reader.lines().enumerate();
    let mut frames = Vec::new();

    while let Some((idx, header)) = lines.next() {
        let header = header.map_err(|err| parse_err(idx + 1, err.to_string()))?;
        let header = header.trim();
        if header.is_empty() {
            continue;
        }
        let n_atoms: usize = header
            .parse()
            .map_err(|_| parse_err(idx + 1, format!("expected atom count, found {header:?}")))?;

        let (comment_idx, comment) = lines
            .next()
            .ok_or_else(|| parse_err(idx + 2, "missing comment line".to_string()))?;
        let comment = comment.map_err(|err| parse_err(comment_idx + 1, err.to_string()))?;

        let mut atom_lines = Vec::new();
        for _ in 0..n_atoms {
            let (line_idx, line) = lines.next().ok_or_else(|| {
                parse_err(
                    comment_idx + 2 + atom_lines.len(),
                    format!("expected {n_atoms} atoms, file ended early"),
                )
            })?;
            let line = line.map_err(|err| parse_err(line_idx + 1, err.to_string()))?;
            atom_lines.push((line_idx + 1, line));
        }

        let frame = parse_frame(&comment, &atom_lines)
            .map_err(|(line, message)| parse_err(line.unwrap_or(comment_idx + 1), message))?;
        frames.push(frame);
    }

    Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Str,
    Real,
    Int,
    Logical,
}

#[derive(Debug)]
struct Property {
    name: String,
    kind: Column,
    width: usize,
}

type FrameError = (Option<usize>, String);

fn parse_frame(comment: &str, atom_lines: &[(usize, String)]) -> Result<Structure, FrameError> {
    let pairs = parse_key_values(comment).map_err(|msg| (None, msg))?;

    let mut properties_spec = DEFAULT_PROPERTIES.to_string();
    let mut cell = None;
    let mut pbc = None;
    let mut info = std::collections::BTreeMap::new();

    for (key, value) in pairs {
        match key.as_str() {
            "Properties" => properties_spec = value,
            "Lattice" => {
                let values = parse_floats(&value)
                    .filter(|values| values.len() == 9)
                    .ok_or_else(|| (None, format!("Lattice must hold 9 numbers: {value:?}")))?;
                cell = Some([
                    [values[0], values[1], values[2]],
                    [values[3], values[4], values[5]],
                    [values[6], values[7], values[8]],
                ]);
            }
            "pbc" => {
                let flags = value
                    .split_whitespace()
                    .map(parse_bool)
                    .collect::<Option<Vec<_>>>()
                    .filter(|flags| flags.len() == 3)
                    .ok_or_else(|| (None, format!("pbc must hold 3 flags: {value:?}")))?;
                pbc = Some([flags[0], flags[1], flags[2]]);
            }
            _ => {
                info.insert(key, parse_info_value(&value));
            }
        }
    }

    let properties = parse_properties(&properties_spec).map_err(|msg| (None, msg))?;
    let expected_columns = properties
        .iter()
        .try_fold(0usize, |total, p| total.checked_add(p.width))
        .ok_or_else(|| (None, format!("Properties widths overflow: {properties_spec:?}")))?;

    let mut columns: Vec<Vec<&str>> = properties.iter().map(|_| Vec::new()).collect();

    for (line_no, line) in atom_lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != expected_columns {
            return Err((
                Some(*line_no),
                format!(
                    "expected {expected_columns} columns, found {}",
                    tokens.len()
                ),
            ));
        }
        let mut offset = 0;
        for (i, prop) in properties.iter().enumerate() {
            columns[i].extend_from_slice(&tokens[offset..offset + prop.width]);
            offset += prop.width;
        }
    }

    let mut symbols = None;
    let mut positions = None;
    let mut arrays = std::collections::BTreeMap::new();

    for (prop, raw) in properties.iter().zip(columns) {
        let values = convert_column(prop, &raw).map_err(|msg| (None, msg))?;
        match (prop.name.as_str(), values) {
            ("species", ArrayValues::Str(values)) if prop.width == 1 => symbols = Some(values),
            ("pos", ArrayValues::Float(values)) if prop.width == 3 => {
                positions = Some(
                    values
                        .chunks_exact(3)
                        .map(|c| [c[0], c[1], c[2]])
                        .collect::<Vec<_>>(),
                );
            }
            (_, values) => {
                arrays.insert(
                    prop.name.clone(),
                    AtomArray {
                        width: prop.width,
                        values,
                    },
                );
            }
        }
    }

    let symbols = symbols.ok_or_else(|| (None, "Properties lacks species:S:1".to_string()))?;
    let positions = positions.ok_or_else(|| (None, "Properties lacks pos:R:3".to_string()))?;

    Ok(Structure {
        symbols,
        positions,
        pbc: pbc.unwrap_or([cell.is_some(); 3]),
        cell,
        arrays,
        info,
    })
}

fn convert_column(prop: &Property, raw: &[&str]) -> Result<ArrayValues, String> {
    let bad = |token: &str| format!("invalid value {token:?} for property {}", prop.name);
    Ok(match prop.kind {
        Column::Str => ArrayValues::Str(raw.iter().map(|t| t.to_string()).collect()),
        Column::Real => ArrayValues::Float(
            raw.iter()
                .map(|t| t.parse::<f64>().map_err(|_| bad(t)))
                .collect::<Result<_, _>>()?,
        ),
        Column::Int => ArrayValues::Int(
            raw.iter()
                .map(|t| t.parse::<i64>().map_err(|_| bad(t)))
                .collect::<Result<_, _>>()?,
        ),
        Column::Logical => ArrayValues::Bool(
            raw.iter()
                .map(|t| parse_bool(t).ok_or_else(|| bad(t)))
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn parse_properties(spec: &str) -> Result<Vec<Property>, String> {
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() % 3 != 0 || fields.is_empty() {
        return Err(format!("malformed Properties: {spec:?}"));
    }
    fields
        .chunks_exact(3)
        .map(|chunk| {
            let kind = match chunk[1] {
                "S" => Column::Str,
                "R" => Column::Real,
                "I" => Column::Int,
                "L" => Column::Logical,
                other => return Err(format!("unknown property type {other:?} in {spec:?}")),
            };
            let width = chunk[2]
                .parse::<usize>()
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| format!("invalid property width in {spec:?}"))?;
            Ok(Property {
                name: chunk[0].to_string(),
                kind,
                width,
            })
        })
        .collect()
}

/// Splits a comment line into `key=value` pairs. Values may be bare,
/// double-quoted (with `\"` escapes) or brace-delimited. A key with no `=`
/// is a boolean flag.
fn parse_key_values(line: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            pairs.push((key, "T".to_string()));
            continue;
        }
        chars.next();
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        match chars.peek() {
            Some('"') => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                if !closed {
                    return Err(format!("unterminated quote for key {key:?}"));
                }
            }
            Some('{') => {
                chars.next();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(format!("unterminated brace for key {key:?}"));
                }
                value = value.replace(',', " ");
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}

fn parse_bool(token: &str) -> Option<bool> {
    match token {
        "T" | "True" | "true" => Some(true),
        "F" | "False" | "false" => Some(false),
        _ => None,
    }
}

fn parse_floats(value: &str) -> Option<Vec<f64>> {
    value
        .split_whitespace()
        .map(|t| t.parse::<f64>().ok())
        .collect()
}

fn parse_info_value(value: &str) -> InfoValue {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() == 1 {
        let token = tokens[0];
        if let Ok(v) = token.parse::<i64>() {
            return InfoValue::Int(v);
        }
        if let Ok(v) = token.parse::<f64>() {
            return InfoValue::Float(v);
        }
        if let Some(v) = parse_bool(token) {
            return InfoValue::Bool(v);
        }
    } else if tokens.len() > 1 {
        if let Some(ints) = tokens
            .iter()
            .map(|t| t.parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()
        {
            return InfoValue::IntArray(ints);
        }
        if let Some(floats) = parse_floats(value) {
            return InfoValue::FloatArray(floats);
        }
    }
    InfoValue::Str(value.to_string())
}

/// Writes `structures` as extended XYZ. Floats use the shortest
/// representation that parses back to the same bits.
///
/// Fails with `InvalidData` for anything that would not read back as
/// written: field names that are not plain tokens, per-atom strings that
/// are empty or contain whitespace, and per-structure strings that span
/// lines or look like a number or flag (`"5"`, `"T"`).
pub fn write_frames<W: Write>(mut out: W, structures: &[Structure]) -> io::Result<()> {
    for s in structures {
        check_writable(s)?;
        writeln!(out, "{}", s.len())?;

        let mut comment = Vec::new();
        if let Some(cell) = &s.cell {
            let flat: Vec<String> = cell.iter().flatten().map(|v| format!("{v:?}")).collect();
            comment.push(format!("Lattice=\"{}\"", flat.join(" ")));
        }
        let mut properties = DEFAULT_PROPERTIES.to_string();
        for (name, array) in &s.arrays {
            let kind = match array.values {
                ArrayValues::Float(_) => 'R',
                ArrayValues::Int(_) => 'I',
                ArrayValues::Bool(_) => 'L',
                ArrayValues::Str(_) => 'S',
            };
            properties.push_str(&format!(":{name}:{kind}:{}", array.width));
        }
        comment.push(format!("Properties={properties}"));
        for (key, value) in &s.info {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            comment.push(format!("{key}={}", format_info(value)));
        }
        let pbc: Vec<&str> = s.pbc.iter().map(|p| if *p { "T" } else { "F" }).collect();
        comment.push(format!("pbc=\"{}\"", pbc.join(" ")));
        writeln!(out, "{}", comment.join(" "))?;

        for (i, (symbol, pos)) in s.symbols.iter().zip(&s.positions).enumerate() {
            let mut row = format!("{symbol} {:?} {:?} {:?}", pos[0], pos[1], pos[2]);
            for array in s.arrays.values() {
                let start = i * array.width;
                for j in start..start + array.width {
                    row.push(' ');
                    match &array.values {
                        ArrayValues::Float(v) => row.push_str(&format!("{:?}", v[j])),
                        ArrayValues::Int(v) => row.push_str(&v[j].to_string()),
                        ArrayValues::Bool(v) => row.push(if v[j] { 'T' } else { 'F' }),
                        ArrayValues::Str(v) => row.push_str(&v[j]),
                    }
                }
            }
            writeln!(out, "{row}")?;
        }
    }
    Ok(())
}

fn check_writable(s: &Structure) -> io::Result<()> {
    let invalid = |message: String| io::Error::new(io::ErrorKind::InvalidData, message);
    let plain_token = |name: &str| {
        !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || matches!(c, '=' | '"' | ':'))
    };
    for (name, array) in &s.arrays {
        if !plain_token(name) {
            return Err(invalid(format!("per-atom field name {name:?} cannot be written")));
        }
        if let ArrayValues::Str(values) = &array.values {
            if let Some(bad) = values
                .iter()
                .find(|v| v.is_empty() || v.chars().any(char::is_whitespace))
            {
                return Err(invalid(format!("per-atom value {bad:?} in {name} cannot be written")));
            }
        }
    }
    for (key, value) in &s.info {
        if !plain_token(key) {
            return Err(invalid(format!("per-structure field name {key:?} cannot be written")));
        }
        if let InfoValue::Str(text) = value {
            if text.contains(['\n', '\r']) || parse_info_value(text) != *value {
                return Err(invalid(format!("per-structure value {key}={text:?} would not read back as a string")));
            }
        }
    }
    Ok(())
}

fn format_info(value: &InfoValue) -> String {
    match value {
        InfoValue::Float(v) => format!("{v:?}"),
        InfoValue::Int(v) => v.to_string(),
        InfoValue::Bool(true) => "T".to_string(),
        InfoValue::Bool(false) => "F".to_string(),
        InfoValue::Str(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
        InfoValue::FloatArray(v) => {
            let items: Vec<String> = v.iter().map(|x| format!("{x:?}")).collect();
            format!("\"{}\"", items.join(" "))
        }
        InfoValue::IntArray(v) => {
            let items: Vec<String> = v.iter().map(|x| x.to_string()).collect();
            format!("\"{}\"", items.join(" "))
        }
    }
}
