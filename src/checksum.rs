use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::LoadAtomsError;

/// Length of the truncated digests recorded in the catalog.
pub const SHORT_CHECKSUM_LEN: usize = 12;

/// Full lowercase hex SHA-256 digest of a file, read in blocks.
pub fn sha256_file(path: &Path) -> Result<String, LoadAtomsError> {
    let mut file = File::open(path)
        .map_err(|err| LoadAtomsError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(LoadAtomsError::Filesystem(format!(
                    "read {}: {err}",
                    path.display()
                )));
            }
        };
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// The checksum format used in dataset descriptions.
pub fn generate_checksum(path: &Path) -> Result<String, LoadAtomsError> {
    let mut digest = sha256_file(path)?;
    digest.truncate(SHORT_CHECKSUM_LEN);
    Ok(digest)
}

/// Between 12 and 64 hex characters.
pub fn is_valid_checksum(checksum: &str) -> bool {
    (SHORT_CHECKSUM_LEN..=64).contains(&checksum.len())
        && checksum.chars().all(|c| c.is_ascii_hexdigit())
}

/// Compares `expected` against the same-length prefix of the file's digest.
pub fn matches_checksum(path: &Path, expected: &str) -> Result<bool, LoadAtomsError> {
    let actual = sha256_file(path)?;
    Ok(digest_matches(&actual, expected))
}

/// Fails with [`LoadAtomsError::Integrity`] naming `label` on mismatch.
pub fn verify(path: &Path, expected: &str, label: &str) -> Result<(), LoadAtomsError> {
    let actual = sha256_file(path)?;
    if digest_matches(&actual, expected) {
        tracing::debug!(file = label, "checksum verified");
        return Ok(());
    }
    let shown = actual.get(..expected.len()).unwrap_or(&actual).to_string();
    Err(LoadAtomsError::Integrity {
        file: label.to_string(),
        expected: expected.to_string(),
        actual: shown,
    })
}

fn digest_matches(actual: &str, expected: &str) -> bool {
    is_valid_checksum(expected)
        && actual
            .get(..expected.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn hello_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"hello world").unwrap();
        file
    }

    #[test]
    fn full_and_short_digests() {
        let file = hello_file();
        assert_eq!(sha256_file(file.path()).unwrap(), HELLO);
        assert_eq!(generate_checksum(file.path()).unwrap(), &HELLO[..12]);
    }

    #[test]
    fn accepts_any_valid_prefix_length() {
        let file = hello_file();
        assert!(matches_checksum(file.path(), &HELLO[..12]).unwrap());
        assert!(matches_checksum(file.path(), HELLO).unwrap());
        assert!(matches_checksum(file.path(), &HELLO[..20].to_uppercase()).unwrap());
        assert!(!matches_checksum(file.path(), &HELLO[..8]).unwrap());
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"hello worle").unwrap();
        let err = verify(file.path(), &HELLO[..12], "hello.txt").unwrap_err();
        assert_matches!(err, LoadAtomsError::Integrity { ref file, .. } if file == "hello.txt");
    }

    #[test]
    fn checksum_validation() {
        assert!(is_valid_checksum("0123456789ab"));
        assert!(!is_valid_checksum("0123456789a"));
        assert!(!is_valid_checksum("0123456789ag"));
    }
}
