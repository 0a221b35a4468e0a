use std::io::{self, Write};

use serde::Serialize;

use crate::api::{InfoResult, ListResult, LoadSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_load(result: &LoadSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_load(result: &LoadSummary) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "{}: {} structures, {} atoms ({}, {})",
            result.input,
            result.structures,
            result.atoms,
            origin_label(result),
            result.storage
        )?;
        if !result.per_atom_properties.is_empty() {
            writeln!(out, "  per-atom: {}", result.per_atom_properties.join(", "))?;
        }
        if !result.per_structure_properties.is_empty() {
            writeln!(out, "  per-structure: {}", result.per_structure_properties.join(", "))?;
        }
        Ok(())
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if result.datasets.is_empty() {
            writeln!(out, "no cached datasets under {}", result.root)?;
            return Ok(());
        }
        let width = result.datasets.iter().map(|d| d.id.len()).max().unwrap_or(0);
        for entry in &result.datasets {
            writeln!(
                out,
                "{:<width$}  {:>9} structures  {:<6}  {}",
                entry.id, entry.structures, entry.format, entry.written_at
            )?;
        }
        Ok(())
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", result.id)?;
        writeln!(out, "  {}", result.description.trim())?;
        if let Some(year) = result.year {
            writeln!(out, "  year: {year}")?;
        }
        if let Some(category) = &result.category {
            writeln!(out, "  category: {category}")?;
        }
        match (&result.license, &result.license_url) {
            (Some(license), Some(url)) => writeln!(out, "  license: {license} ({url})")?,
            (Some(license), None) => writeln!(out, "  license: {license}")?,
            _ => {}
        }
        if let Some(version) = &result.minimum_version {
            writeln!(out, "  requires load-atoms >= {version}")?;
        }
        writeln!(out, "  files: {}", result.files.join(", "))?;
        writeln!(out, "  processing: {}", result.processing.join(" -> "))?;
        match result.cached_structures {
            Some(n) => writeln!(out, "  cached: yes ({n} structures)")?,
            None => writeln!(out, "  cached: no")?,
        }
        writeln!(out, "  {}", result.url)?;
        Ok(())
    }
}

fn origin_label(result: &LoadSummary) -> &'static str {
    match result.origin {
        crate::api::LoadOrigin::Memory => "in memory",
        crate::api::LoadOrigin::Path => "read from disk",
        crate::api::LoadOrigin::Cache => "from cache",
        crate::api::LoadOrigin::Built => "downloaded",
    }
}
