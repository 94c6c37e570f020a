//! Content fingerprints for incremental ingestion.
//!
//! A document's identity is the SHA-256 of its bytes, rendered as lowercase
//! hex. Files are streamed through the hasher so arbitrarily large documents
//! never need to fit in memory.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// Hash a file's contents, blocking the calling thread.
pub fn hash_file_blocking(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| RagError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| RagError::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file's contents on the blocking pool.
pub async fn hash_file(path: &Path) -> Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path)).await?
}

/// Short stable tag for a string, used to disambiguate derived file names.
pub fn short_tag(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("abc.pdf");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file_blocking(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_identical_bytes_same_digest() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.epub");
        std::fs::create_dir_all(tmp.path().join("nested")).unwrap();
        let b = tmp.path().join("nested").join("copy.epub");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = hash_file_blocking(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, RagError::Io { .. }));
    }

    #[test]
    fn test_short_tag_is_stable() {
        assert_eq!(short_tag("a/b.pdf"), short_tag("a/b.pdf"));
        assert_ne!(short_tag("a/b.pdf"), short_tag("c/b.pdf"));
        assert_eq!(short_tag("x").len(), 8);
    }
}
