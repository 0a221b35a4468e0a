//! Declarative processing chains.
//!
//! A dataset description lists named steps that turn the directory of
//! downloaded files into structures:
//!
//! ```yaml
//! processing:
//!   - UnZip
//!   - ForEachFile:
//!       pattern: "*.xyz"
//!       steps:
//!         - ReadASE
//!   - Rename:
//!       DFT_energy: energy
//! ```
//!
//! Each step consumes the previous step's output: a filesystem path or a
//! sequence of structures.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::archive::{self, ArchiveKind};
use crate::error::LoadAtomsError;
use crate::extxyz::StructureReader;
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use crate::store::walk_files;
use crate::structure::Structure;

/// Canonical step names, in the order they are usually chained.
pub const STEP_NAMES: &[&str] = &["UnZip", "SelectFile", "ForEachFile", "ReadASE", "Rename", "Custom"];

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingStep {
    /// Unpack an archive into `<archive name>-extracted` next to it.
    UnZip { file: Option<String> },
    /// Narrow a directory to one file, by name or by unique pattern match.
    SelectFile {
        file: Option<String>,
        pattern: Option<String>,
    },
    /// Run `steps` on each selected file and concatenate the results.
    ForEachFile {
        steps: Vec<ProcessingStep>,
        files: Option<Vec<String>>,
        pattern: Option<String>,
    },
    /// Parse structures from a file, or from every readable file in a directory.
    ReadStructures { index: IndexSelection },
    /// Move per-atom / per-structure fields to new keys.
    Rename { mapping: Vec<(String, String)> },
    /// Hand the path to a processor registered under `id`.
    Custom { id: String },
}

impl ProcessingStep {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingStep::UnZip { .. } => "UnZip",
            ProcessingStep::SelectFile { .. } => "SelectFile",
            ProcessingStep::ForEachFile { .. } => "ForEachFile",
            ProcessingStep::ReadStructures { .. } => "ReadASE",
            ProcessingStep::Rename { .. } => "Rename",
            ProcessingStep::Custom { .. } => "Custom",
        }
    }

    /// The chain used when a description declares none.
    pub fn default_chain() -> Vec<ProcessingStep> {
        vec![ProcessingStep::ReadStructures {
            index: IndexSelection::All,
        }]
    }

    /// Parses a YAML step list. Each item is a bare step name or a
    /// single-entry mapping from step name to its parameters.
    pub fn parse_chain(raw: &[Value]) -> Result<Vec<ProcessingStep>, LoadAtomsError> {
        raw.iter().map(ProcessingStep::parse).collect()
    }

    pub fn parse(raw: &Value) -> Result<ProcessingStep, LoadAtomsError> {
        match raw {
            Value::String(name) => Self::from_parts(name, &Mapping::new()),
            Value::Mapping(map) if map.len() == 1 => {
                let (key, params) = map.iter().next().ok_or_else(|| step_err("?", "empty step"))?;
                let name = key
                    .as_str()
                    .ok_or_else(|| step_err("?", "step name must be a string"))?;
                match params {
                    Value::Null => Self::from_parts(name, &Mapping::new()),
                    Value::Mapping(params) => Self::from_parts(name, params),
                    _ => Err(step_err(name, "parameters must be a mapping")),
                }
            }
            other => Err(step_err(
                "?",
                &format!("expected a step name or a single-key mapping, found {other:?}"),
            )),
        }
    }

    fn from_parts(name: &str, params: &Mapping) -> Result<ProcessingStep, LoadAtomsError> {
        let params = Params::new(name, params)?;
        let step = match name {
            "UnZip" | "UnpackArchive" => ProcessingStep::UnZip {
                file: params.opt_str("file")?,
            },
            "SelectFile" => {
                let file = params.opt_str("file")?;
                let pattern = params.opt_str("pattern")?;
                if file.is_some() == pattern.is_some() {
                    return Err(step_err(name, "exactly one of `file` or `pattern` is required"));
                }
                if let Some(pattern) = &pattern {
                    glob_regex(pattern).map_err(|msg| step_err(name, &msg))?;
                }
                ProcessingStep::SelectFile { file, pattern }
            }
            "ForEachFile" => {
                let steps = match params.get("steps") {
                    Some(Value::Sequence(steps)) => Self::parse_chain(steps)?,
                    Some(_) => return Err(step_err(name, "`steps` must be a list")),
                    None => return Err(step_err(name, "`steps` is required")),
                };
                let files = params.opt_str_list("files")?;
                let pattern = params.opt_str("pattern")?;
                if files.is_some() && pattern.is_some() {
                    return Err(step_err(name, "`files` and `pattern` are mutually exclusive"));
                }
                if let Some(pattern) = &pattern {
                    glob_regex(pattern).map_err(|msg| step_err(name, &msg))?;
                }
                ProcessingStep::ForEachFile {
                    steps,
                    files,
                    pattern,
                }
            }
            "ReadASE" | "ParseStructures" | "ReadStructures" => {
                if let Some(format) = params.opt_str("format")? {
                    if !matches!(format.as_str(), "extxyz" | "xyz") {
                        return Err(step_err(name, &format!("unsupported format {format:?}")));
                    }
                }
                let index = match params.get("index") {
                    None => IndexSelection::All,
                    Some(Value::Number(n)) => IndexSelection::Single(
                        n.as_i64().ok_or_else(|| step_err(name, "`index` must be an integer"))?,
                    ),
                    Some(Value::String(s)) => s.parse().map_err(|msg: String| step_err(name, &msg))?,
                    Some(_) => return Err(step_err(name, "`index` must be an integer or slice")),
                };
                ProcessingStep::ReadStructures { index }
            }
            "Rename" | "RenameFields" => {
                let mapping = params.all_str_pairs()?;
                if mapping.is_empty() {
                    return Err(step_err(name, "at least one `old: new` pair is required"));
                }
                ProcessingStep::Rename { mapping }
            }
            "Custom" | "CustomScript" => ProcessingStep::Custom {
                id: params
                    .opt_str("id")?
                    .ok_or_else(|| step_err(name, "`id` is required"))?,
            },
            unknown => {
                return Err(LoadAtomsError::UnknownStep {
                    name: unknown.to_string(),
                    expected: STEP_NAMES.join(", "),
                });
            }
        };
        params.reject_unused(step.name())?;
        Ok(step)
    }
}

impl fmt::Display for ProcessingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingStep::UnZip { file: Some(file) } => write!(f, "UnZip({file})"),
            ProcessingStep::UnZip { file: None } => write!(f, "UnZip()"),
            ProcessingStep::SelectFile { file, pattern } => {
                write!(f, "SelectFile({})", file.as_deref().or(pattern.as_deref()).unwrap_or(""))
            }
            ProcessingStep::ForEachFile { steps, .. } => write!(f, "ForEachFile({} steps)", steps.len()),
            ProcessingStep::ReadStructures { .. } => write!(f, "ReadASE()"),
            ProcessingStep::Rename { mapping } => write!(f, "Rename({} fields)", mapping.len()),
            ProcessingStep::Custom { id } => write!(f, "Custom({id})"),
        }
    }
}

fn step_err(step: &str, message: &str) -> LoadAtomsError {
    LoadAtomsError::StepConfig {
        step: step.to_string(),
        message: message.to_string(),
    }
}

/// Step parameters with tracking of which keys were consumed.
struct Params<'a> {
    step: &'a str,
    entries: Vec<(String, &'a Value)>,
    used: std::cell::RefCell<Vec<String>>,
}

impl<'a> Params<'a> {
    fn new(step: &'a str, map: &'a Mapping) -> Result<Self, LoadAtomsError> {
        let entries = map
            .iter()
            .map(|(k, v)| {
                k.as_str()
                    .map(|k| (k.to_string(), v))
                    .ok_or_else(|| step_err(step, "parameter names must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            step,
            entries,
            used: std::cell::RefCell::new(Vec::new()),
        })
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.used.borrow_mut().push(key.to_string());
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    fn opt_str(&self, key: &str) -> Result<Option<String>, LoadAtomsError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(step_err(self.step, &format!("`{key}` must be a string"))),
        }
    }

    fn opt_str_list(&self, key: &str) -> Result<Option<Vec<String>>, LoadAtomsError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| step_err(self.step, &format!("`{key}` must list strings")))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(step_err(self.step, &format!("`{key}` must be a list"))),
        }
    }

    fn all_str_pairs(&self) -> Result<Vec<(String, String)>, LoadAtomsError> {
        self.entries
            .iter()
            .map(|(k, v)| {
                self.used.borrow_mut().push(k.clone());
                v.as_str()
                    .map(|v| (k.clone(), v.to_string()))
                    .ok_or_else(|| step_err(self.step, &format!("new name for `{k}` must be a string")))
            })
            .collect()
    }

    fn reject_unused(&self, step: &str) -> Result<(), LoadAtomsError> {
        let used = self.used.borrow();
        match self.entries.iter().find(|(k, _)| !used.contains(k)) {
            Some((k, _)) => Err(step_err(step, &format!("unknown parameter `{k}`"))),
            None => Ok(()),
        }
    }
}

/// Which parsed frames to keep, with Python-style negative indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSelection {
    All,
    Single(i64),
    Slice { start: Option<i64>, stop: Option<i64> },
}

impl std::str::FromStr for IndexSelection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value == ":" {
            return Ok(IndexSelection::All);
        }
        let bound = |s: &str| -> Result<Option<i64>, String> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| format!("invalid index {value:?}"))
            }
        };
        match value.split_once(':') {
            Some((start, stop)) => Ok(IndexSelection::Slice {
                start: bound(start)?,
                stop: bound(stop)?,
            }),
            None => bound(value)?
                .map(IndexSelection::Single)
                .ok_or_else(|| format!("invalid index {value:?}")),
        }
    }
}

impl IndexSelection {
    pub fn apply(self, mut frames: Vec<Structure>) -> Vec<Structure> {
        let len = frames.len() as i64;
        let resolve = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
        match self {
            IndexSelection::All => frames,
            IndexSelection::Single(i) => {
                let idx = if i < 0 { len + i } else { i };
                if (0..len).contains(&idx) {
                    vec![frames.swap_remove(idx as usize)]
                } else {
                    Vec::new()
                }
            }
            IndexSelection::Slice { start, stop } => {
                let start = start.map(resolve).unwrap_or(0) as usize;
                let stop = stop.map(resolve).unwrap_or(len) as usize;
                if start >= stop {
                    return Vec::new();
                }
                frames.truncate(stop);
                frames.drain(..start);
                frames
            }
        }
    }
}

pub type CustomProcessor =
    Arc<dyn Fn(&Path) -> Result<Vec<Structure>, LoadAtomsError> + Send + Sync>;

/// Dataset-specific processors, looked up by the `Custom` step's `id`.
#[derive(Clone, Default)]
pub struct CustomRegistry {
    processors: BTreeMap<String, CustomProcessor>,
}

impl CustomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, processor: F)
    where
        F: Fn(&Path) -> Result<Vec<Structure>, LoadAtomsError> + Send + Sync + 'static,
    {
        self.processors.insert(id.into(), Arc::new(processor));
    }

    pub fn get(&self, id: &str) -> Option<&CustomProcessor> {
        self.processors.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }
}

impl fmt::Debug for CustomRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomRegistry")
            .field("ids", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Value flowing between steps.
#[derive(Debug)]
pub enum Working {
    Path(PathBuf),
    Structures(Vec<Structure>),
}

pub struct ProcessingContext<'a> {
    pub reader: &'a dyn StructureReader,
    pub custom: &'a CustomRegistry,
    pub sink: &'a dyn ProgressSink,
}

/// Runs `chain` against `input`, strictly in order. Any step failure aborts
/// the whole chain.
pub fn run_chain(
    chain: &[ProcessingStep],
    input: &Path,
    ctx: &ProcessingContext<'_>,
) -> Result<Vec<Structure>, LoadAtomsError> {
    let mut current = Working::Path(input.to_path_buf());
    for step in chain {
        tracing::debug!(step = %step, "running processing step");
        current = step.apply(current, ctx)?;
    }
    match current {
        Working::Structures(structures) => Ok(structures),
        Working::Path(path) => Err(step_err(
            chain.last().map(ProcessingStep::name).unwrap_or("chain"),
            &format!("chain ended on {} instead of structures", path.display()),
        )),
    }
}

impl ProcessingStep {
    pub fn apply(&self, input: Working, ctx: &ProcessingContext<'_>) -> Result<Working, LoadAtomsError> {
        let name = self.name();
        match self {
            ProcessingStep::UnZip { file } => {
                let path = expect_path(name, input)?;
                let archive_path = match (file, path.is_dir()) {
                    (Some(file), true) => path.join(file),
                    (None, true) => single_file(name, &path)?,
                    (Some(file), false) => {
                        return Err(step_err(
                            name,
                            &format!("`file: {file}` needs a directory, got {}", path.display()),
                        ));
                    }
                    (None, false) => path,
                };
                let kind = ArchiveKind::detect(&archive_path).ok_or_else(|| {
                    step_err(name, &format!("unsupported archive {}", archive_path.display()))
                })?;
                if !archive_path.is_file() {
                    return Err(step_err(name, &format!("{} not found", archive_path.display())));
                }
                let file_name = archive_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("archive")
                    .to_string();
                let extract_to = archive_path.with_file_name(format!("{file_name}-extracted"));
                if extract_to.exists() {
                    fs::remove_dir_all(&extract_to)
                        .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
                }
                ctx.sink
                    .event(ProgressEvent::new(Phase::Process, format!("extracting {file_name}")));
                archive::unpack(&archive_path, kind, &extract_to)?;
                Ok(Working::Path(extract_to))
            }
            ProcessingStep::SelectFile { file, pattern } => {
                let dir = expect_dir(name, input)?;
                if let Some(file) = file {
                    let selected = dir.join(file);
                    if !selected.exists() {
                        return Err(step_err(name, &format!("{} not found", selected.display())));
                    }
                    return Ok(Working::Path(selected));
                }
                let pattern = pattern.as_deref().unwrap_or("*");
                let mut matches = match_files(name, &dir, pattern)?;
                if matches.len() != 1 {
                    return Err(step_err(
                        name,
                        &format!("pattern {pattern:?} matched {} files, expected 1", matches.len()),
                    ));
                }
                Ok(Working::Path(matches.remove(0)))
            }
            ProcessingStep::ForEachFile {
                steps,
                files,
                pattern,
            } => {
                let dir = expect_dir(name, input)?;
                let selected = match (files, pattern) {
                    (Some(files), _) => files.iter().map(|f| dir.join(f)).collect(),
                    (None, Some(pattern)) => match_files(name, &dir, pattern)?,
                    (None, None) => match_files(name, &dir, "*")?,
                };
                let total = selected.len();
                let mut results = Vec::new();
                for (i, file) in selected.iter().enumerate() {
                    ctx.sink.event(ProgressEvent::new(
                        Phase::Process,
                        format!("file {}/{total}: {}", i + 1, display_name(file)),
                    ));
                    results.extend(run_chain(steps, file, ctx)?);
                }
                Ok(Working::Structures(results))
            }
            ProcessingStep::ReadStructures { index } => {
                let path = expect_path(name, input)?;
                let files = if path.is_dir() {
                    let readable: Vec<PathBuf> = walk_files(&path)?
                        .into_iter()
                        .filter(|f| ctx.reader.can_read(f))
                        .collect();
                    if readable.is_empty() {
                        return Err(step_err(
                            name,
                            &format!("no readable structure files in {}", path.display()),
                        ));
                    }
                    readable
                } else {
                    vec![path]
                };
                let mut frames = Vec::new();
                for file in &files {
                    ctx.sink
                        .event(ProgressEvent::new(Phase::Process, format!("reading {}", display_name(file))));
                    frames.extend(ctx.reader.read(file)?);
                }
                Ok(Working::Structures(index.apply(frames)))
            }
            ProcessingStep::Rename { mapping } => {
                let mut structures = match input {
                    Working::Structures(structures) => structures,
                    Working::Path(path) => {
                        return Err(step_err(
                            name,
                            &format!("expects structures, got path {}", path.display()),
                        ));
                    }
                };
                for structure in &mut structures {
                    for (old, new) in mapping {
                        structure.rename_field(old, new);
                    }
                }
                Ok(Working::Structures(structures))
            }
            ProcessingStep::Custom { id } => {
                let path = expect_path(name, input)?;
                let processor = ctx.custom.get(id).ok_or_else(|| {
                    step_err(name, &format!("no custom processor registered for {id:?}"))
                })?;
                ctx.sink
                    .event(ProgressEvent::new(Phase::Process, format!("custom processing {id}")));
                Ok(Working::Structures(processor(&path)?))
            }
        }
    }
}

fn expect_path(step: &str, input: Working) -> Result<PathBuf, LoadAtomsError> {
    match input {
        Working::Path(path) => Ok(path),
        Working::Structures(s) => Err(step_err(
            step,
            &format!("expects a path, got {} structures", s.len()),
        )),
    }
}

fn expect_dir(step: &str, input: Working) -> Result<PathBuf, LoadAtomsError> {
    let path = expect_path(step, input)?;
    if !path.is_dir() {
        return Err(step_err(step, &format!("{} is not a directory", path.display())));
    }
    Ok(path)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// The only non-hidden regular file directly inside `dir`.
fn single_file(step: &str, dir: &Path) -> Result<PathBuf, LoadAtomsError> {
    let mut files = match_files(step, dir, "*")?;
    match files.len() {
        1 => Ok(files.remove(0)),
        n => Err(step_err(
            step,
            &format!("expected a single file in {}, found {n}", dir.display()),
        )),
    }
}

/// Files under `dir` whose `/`-separated relative path matches `pattern`,
/// sorted by that path. Hidden files (in-flight downloads) never match.
fn match_files(step: &str, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, LoadAtomsError> {
    let regex = glob_regex(pattern).map_err(|msg| step_err(step, &msg))?;
    let mut matched: Vec<(String, PathBuf)> = walk_files(dir)?
        .into_iter()
        .filter_map(|path| {
            let relative = path.strip_prefix(dir).ok()?;
            let rel = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let hidden = rel.split('/').any(|part| part.starts_with('.'));
            (!hidden && regex.is_match(&rel)).then_some((rel, path))
        })
        .collect();
    matched.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(matched.into_iter().map(|(_, path)| path).collect())
}

/// Translates a shell glob into an anchored regex. `*` and `?` stay within
/// one path segment, `**` crosses segments.
pub fn glob_regex(pattern: &str) -> Result<Regex, String> {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| format!("unclosed `[` in pattern {pattern:?}"))?;
                let body: String = chars[i + 1..i + 1 + close].iter().collect();
                let body = match body.strip_prefix('!') {
                    Some(rest) => format!("^{rest}"),
                    None => body,
                };
                out.push('[');
                out.push_str(&body.replace('\\', "\\\\"));
                out.push(']');
                i += close + 2;
                continue;
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).map_err(|err| format!("invalid pattern {pattern:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse_yaml(text: &str) -> Result<Vec<ProcessingStep>, LoadAtomsError> {
        let raw: Vec<Value> = serde_yaml::from_str(text).unwrap();
        ProcessingStep::parse_chain(&raw)
    }

    #[test]
    fn parses_bare_and_parameterised_steps() {
        let chain = parse_yaml(
            r#"
- UnZip
- SelectFile:
    file: data.xyz
- ReadASE:
    index: "1:"
- Rename:
    DFT_energy: energy
    DFT_forces: forces
"#,
        )
        .unwrap();
        assert_eq!(
            chain,
            vec![
                ProcessingStep::UnZip { file: None },
                ProcessingStep::SelectFile {
                    file: Some("data.xyz".into()),
                    pattern: None
                },
                ProcessingStep::ReadStructures {
                    index: IndexSelection::Slice {
                        start: Some(1),
                        stop: None
                    }
                },
                ProcessingStep::Rename {
                    mapping: vec![
                        ("DFT_energy".into(), "energy".into()),
                        ("DFT_forces".into(), "forces".into())
                    ]
                },
            ]
        );
    }

    #[test]
    fn aliases_map_to_canonical_steps() {
        let chain = parse_yaml("- UnpackArchive\n- ParseStructures\n- CustomScript: {id: qm9}\n").unwrap();
        let names: Vec<_> = chain.iter().map(ProcessingStep::name).collect();
        assert_eq!(names, vec!["UnZip", "ReadASE", "Custom"]);
    }

    #[test]
    fn nested_for_each_file() {
        let chain = parse_yaml(
            "- ForEachFile:\n    pattern: \"*.xyz\"\n    steps:\n      - ReadASE\n",
        )
        .unwrap();
        assert_matches!(
            &chain[0],
            ProcessingStep::ForEachFile { steps, pattern: Some(p), files: None }
                if steps.len() == 1 && p == "*.xyz"
        );
    }

    #[test]
    fn unknown_step_name() {
        let err = parse_yaml("- Explode\n").unwrap_err();
        assert_matches!(err, LoadAtomsError::UnknownStep { ref name, .. } if name == "Explode");
    }

    #[test]
    fn invalid_parameters() {
        assert_matches!(
            parse_yaml("- SelectFile\n").unwrap_err(),
            LoadAtomsError::StepConfig { .. }
        );
        assert_matches!(
            parse_yaml("- UnZip: {file: a.zip, bogus: 1}\n").unwrap_err(),
            LoadAtomsError::StepConfig { .. }
        );
        assert_matches!(
            parse_yaml("- ForEachFile: {pattern: '*'}\n").unwrap_err(),
            LoadAtomsError::StepConfig { .. }
        );
        assert_matches!(
            parse_yaml("- Rename: {}\n").unwrap_err(),
            LoadAtomsError::StepConfig { .. }
        );
        assert_matches!(
            parse_yaml("- ReadASE: {format: cif}\n").unwrap_err(),
            LoadAtomsError::StepConfig { .. }
        );
    }

    #[test]
    fn index_selection_semantics() {
        let frames: Vec<Structure> = (0..5)
            .map(|i| {
                let mut s = Structure::new(vec!["H".into()], vec![[0.0; 3]]);
                s.info.insert("i".into(), crate::structure::InfoValue::Int(i));
                s
            })
            .collect();
        let ids = |sel: IndexSelection| -> Vec<i64> {
            sel.apply(frames.clone())
                .iter()
                .map(|s| match s.info["i"] {
                    crate::structure::InfoValue::Int(i) => i,
                    _ => unreachable!(),
                })
                .collect()
        };
        assert_eq!(ids(":".parse().unwrap()), vec![0, 1, 2, 3, 4]);
        assert_eq!(ids("-1".parse().unwrap()), vec![4]);
        assert_eq!(ids("1:3".parse().unwrap()), vec![1, 2]);
        assert_eq!(ids(":-2".parse().unwrap()), vec![0, 1, 2]);
        assert_eq!(ids("7".parse().unwrap()), Vec::<i64>::new());
    }

    #[test]
    fn glob_translation() {
        let re = glob_regex("*.xyz").unwrap();
        assert!(re.is_match("a.xyz"));
        assert!(!re.is_match("dir/a.xyz"));
        assert!(!re.is_match("a.xyzz"));

        let deep = glob_regex("**/*.xyz").unwrap();
        assert!(deep.is_match("a.xyz"));
        assert!(deep.is_match("x/y/a.xyz"));

        let class = glob_regex("frame_[0-9].xyz").unwrap();
        assert!(class.is_match("frame_3.xyz"));
        assert!(!class.is_match("frame_a.xyz"));
    }

    #[test]
    fn unzip_file_param_requires_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("data.zip");
        fs::write(&archive, b"not really a zip").unwrap();
        let custom = CustomRegistry::new();
        let ctx = ProcessingContext {
            reader: &crate::extxyz::ExtXyzReader,
            custom: &custom,
            sink: &crate::progress::NoopSink,
        };
        let step = ProcessingStep::UnZip {
            file: Some("other.zip".into()),
        };
        let err = step.apply(Working::Path(archive), &ctx).unwrap_err();
        assert_matches!(err, LoadAtomsError::StepConfig { ref step, .. } if step == "UnZip");
    }
}
