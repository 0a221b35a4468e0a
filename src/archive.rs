use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::LoadAtomsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    /// A single gzip-compressed file.
    Gzip,
    /// A single bzip2-compressed file.
    Bzip2,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
            ArchiveKind::TarBz2
        } else if name.ends_with(".tar") {
            ArchiveKind::Tar
        } else if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else if name.ends_with(".gz") {
            ArchiveKind::Gzip
        } else if name.ends_with(".bz2") {
            ArchiveKind::Bzip2
        } else {
            return None;
        };
        Some(kind)
    }
}

/// Unpacks `archive` into `target_dir`, which is created if missing.
pub fn unpack(archive: &Path, kind: ArchiveKind, target_dir: &Path) -> Result<(), LoadAtomsError> {
    fs::create_dir_all(target_dir).map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    match kind {
        ArchiveKind::Zip => extract_zip(archive, target_dir),
        ArchiveKind::Tar => extract_tar(archive, open(archive)?, target_dir),
        ArchiveKind::TarGz => extract_tar(archive, GzDecoder::new(open(archive)?), target_dir),
        ArchiveKind::TarBz2 => extract_tar(archive, BzDecoder::new(open(archive)?), target_dir),
        ArchiveKind::Gzip => gunzip(archive, target_dir).map(|_| ()),
        ArchiveKind::Bzip2 => bunzip2(archive, target_dir).map(|_| ()),
    }
}

fn open(path: &Path) -> Result<fs::File, LoadAtomsError> {
    fs::File::open(path)
        .map_err(|err| LoadAtomsError::Filesystem(format!("open {}: {err}", path.display())))
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), LoadAtomsError> {
    let file = open(zip_path)?;
    let mut archive = ZipArchive::new(file).map_err(|err| {
        LoadAtomsError::Filesystem(format!("read zip {}: {err}", zip_path.display()))
    })?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(LoadAtomsError::Filesystem(format!(
                    "zip entry path traversal detected in {}",
                    zip_path.display()
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Entries that would land outside `target_dir` are skipped by `tar`.
fn extract_tar<R: Read>(archive_path: &Path, reader: R, target_dir: &Path) -> Result<(), LoadAtomsError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.unpack(target_dir).map_err(|err| {
        LoadAtomsError::Filesystem(format!("extract tar {}: {err}", archive_path.display()))
    })
}

/// Decompresses a single-member gzip file to `target_dir/<name without .gz>`.
pub fn gunzip(gz_path: &Path, target_dir: &Path) -> Result<PathBuf, LoadAtomsError> {
    decompress_single(gz_path, GzDecoder::new(open(gz_path)?), target_dir)
}

/// Decompresses a bzip2 file to `target_dir/<name without .bz2>`.
pub fn bunzip2(bz_path: &Path, target_dir: &Path) -> Result<PathBuf, LoadAtomsError> {
    decompress_single(bz_path, BzDecoder::new(open(bz_path)?), target_dir)
}

fn decompress_single<R: Read>(
    path: &Path,
    mut decoder: R,
    target_dir: &Path,
) -> Result<PathBuf, LoadAtomsError> {
    let stem = path
        .file_stem()
        .ok_or_else(|| LoadAtomsError::Filesystem(format!("bad archive name {}", path.display())))?;
    let output = target_dir.join(stem);
    let mut outfile =
        fs::File::create(&output).map_err(|err| LoadAtomsError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut outfile).map_err(|err| {
        LoadAtomsError::Filesystem(format!("decompress {}: {err}", path.display()))
    })?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bzip2::write::BzEncoder;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn tar_bytes<W: Write>(out: W) -> W {
        let mut builder = tar::Builder::new(out);
        for (name, body) in [("inner/data.xyz", &b"1\n\nH 0 0 0\n"[..]), ("README", &b"readme"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn detects_supported_archives() {
        assert_eq!(ArchiveKind::detect(Path::new("a.ZIP")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("a.xyz.gz")), Some(ArchiveKind::Gzip));
        assert_eq!(ArchiveKind::detect(Path::new("data.tar.gz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("data.tgz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("qm9.tar.bz2")), Some(ArchiveKind::TarBz2));
        assert_eq!(ArchiveKind::detect(Path::new("a.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect(Path::new("a.xyz.bz2")), Some(ArchiveKind::Bzip2));
        assert_eq!(ArchiveKind::detect(Path::new("a.xyz")), None);
    }

    #[test]
    fn zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("data.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("inner/data.xyz", options).unwrap();
            writer.write_all(b"1\n\nH 0 0 0\n").unwrap();
            writer.finish().unwrap();
        }
        let out = dir.path().join("out");
        unpack(&zip_path, ArchiveKind::Zip, &out).unwrap();
        assert!(out.join("inner/data.xyz").is_file());
    }

    #[test]
    fn gunzip_strips_extension() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("frames.xyz.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        encoder.finish().unwrap();

        let out = gunzip(&gz_path, dir.path()).unwrap();
        assert_eq!(out.file_name().unwrap(), "frames.xyz");
        assert_eq!(fs::read(out).unwrap(), b"payload");
    }

    #[test]
    fn tar_variants_unpack() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("data.tar");
        tar_bytes(fs::File::create(&plain).unwrap());

        let gz = dir.path().join("data.tar.gz");
        tar_bytes(GzEncoder::new(fs::File::create(&gz).unwrap(), Compression::default()))
            .finish()
            .unwrap();

        let bz = dir.path().join("data.tar.bz2");
        tar_bytes(BzEncoder::new(fs::File::create(&bz).unwrap(), bzip2::Compression::default()))
            .finish()
            .unwrap();

        for archive in [plain, gz, bz] {
            let kind = ArchiveKind::detect(&archive).unwrap();
            let out = dir.path().join(format!("{kind:?}-out"));
            unpack(&archive, kind, &out).unwrap();
            assert_eq!(fs::read(out.join("inner/data.xyz")).unwrap(), b"1\n\nH 0 0 0\n", "{kind:?}");
            assert!(out.join("README").is_file());
        }
    }

    #[test]
    fn bunzip2_strips_extension() {
        let dir = tempfile::tempdir().unwrap();
        let bz_path = dir.path().join("frames.xyz.bz2");
        let mut encoder = BzEncoder::new(fs::File::create(&bz_path).unwrap(), bzip2::Compression::best());
        encoder.write_all(b"payload").unwrap();
        encoder.finish().unwrap();

        let out = dir.path().join("out");
        unpack(&bz_path, ArchiveKind::Bzip2, &out).unwrap();
        assert_eq!(fs::read(out.join("frames.xyz")).unwrap(), b"payload");
    }
}
