//! Streaming SHA-256 integrity checks
//!
//! Artifacts can be several gigabytes, so files are hashed in fixed-size
//! chunks rather than read into memory.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Hex-encoded SHA-256 of the file at `path`
pub fn digest(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check `path` against an optional expected digest
///
/// With no expectation this is a no-op that returns true. Otherwise the file
/// must exist, be non-empty and hash to `expected` (case-insensitive). Read
/// errors count as a failed verification.
pub fn verify(path: &Path, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return false,
    }

    match digest(path) {
        Ok(actual) => hashes_match(&actual, expected),
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Could not read file for verification");
            false
        }
    }
}

pub fn hashes_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// [`digest`] on the blocking pool
pub async fn digest_file(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || digest(&path))
        .await
        .map_err(std::io::Error::other)?
}

/// [`verify`] on the blocking pool
pub async fn verify_file(path: PathBuf, expected: Option<String>) -> bool {
    tokio::task::spawn_blocking(move || verify(&path, expected.as_deref()))
        .await
        .unwrap_or(false)
}
