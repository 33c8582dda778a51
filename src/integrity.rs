// src/integrity.rs

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::ExecutionError;

/// Hex SHA-256 of a file, streamed in 64 KiB reads.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file against an expected hex digest (case-insensitive).
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<(), ExecutionError> {
    let actual = sha256_file(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ExecutionError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[tokio::test]
    async fn test_known_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(sha256_file(file.path()).await.unwrap(), ABC_SHA256);
        verify_sha256(file.path(), &ABC_SHA256.to_uppercase()).await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_is_permanent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abd").unwrap();
        let err = verify_sha256(file.path(), ABC_SHA256).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ChecksumMismatch { .. }));
        assert!(!err.is_transient());
    }
}
