use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Content fingerprint of a file, used for cheap change detection.
///
/// `Absent` is a distinct sentinel: a missing configuration file and an empty
/// one must compare unequal, otherwise deleting the file would go unnoticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Absent,
    Sha256([u8; 32]),
}

const CHUNK_SIZE: usize = 8192;

impl Digest {
    /// Digest a file's contents in fixed-size chunks.
    ///
    /// Never holds the whole file in memory. Byte-identical contents always
    /// yield identical digests; the reconciler relies on this to skip
    /// redundant reloads.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::Absent),
            Err(e) => return Err(e),
        };

        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::Sha256(hasher.finalize().into()))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Sha256(bytes) => write!(f, "{}", hex::encode(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_contents_identical_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, b"{\"lineages\": []}").unwrap();
        std::fs::write(&b, b"{\"lineages\": []}").unwrap();

        assert_eq!(Digest::of_file(&a).unwrap(), Digest::of_file(&b).unwrap());
    }

    #[test]
    fn test_changed_contents_changed_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"v1").unwrap();
        let before = Digest::of_file(&path).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        let after = Digest::of_file(&path).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let digest = Digest::of_file(&dir.path().join("missing.json")).unwrap();
        assert!(digest.is_absent());
    }

    #[test]
    fn test_empty_file_differs_from_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, b"").unwrap();
        let digest = Digest::of_file(&path).unwrap();

        assert!(!digest.is_absent());
        assert_ne!(digest, Digest::Absent);
    }

    #[test]
    fn test_large_file_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let contents = vec![0xabu8; CHUNK_SIZE * 3 + 17];
        std::fs::write(&path, &contents).unwrap();

        let d1 = Digest::of_file(&path).unwrap();
        let d2 = Digest::of_file(&path).unwrap();
        assert_eq!(d1, d2);
        assert!(!d1.is_absent());
    }
}
