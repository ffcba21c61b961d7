// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File manifests and chunk-level disk access for shared files.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Fixed chunk size used for all shared files.
pub const CHUNK_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifest {
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub file_digest: [u8; 32],
}

/// Number of chunks a file of `total_size` splits into. Empty files
/// have zero chunks.
pub fn chunk_count(total_size: u64, chunk_size: u32) -> u32 {
    total_size.div_ceil(chunk_size as u64) as u32
}

/// Length the chunk at `index` must have. The final chunk carries the
/// remainder; all others are full.
pub fn expected_chunk_len(total_size: u64, chunk_size: u32, index: u32) -> usize {
    let start = index as u64 * chunk_size as u64;
    let remaining = total_size.saturating_sub(start);
    remaining.min(chunk_size as u64) as usize
}

/// Reject any name that is not a bare filename. Shared and download
/// paths are always joined against a configured directory, so a name
/// with separators or parent components would escape it.
pub fn validate_no_traversal(filename: &str) -> anyhow::Result<()> {
    if filename.is_empty() {
        anyhow::bail!("empty filename");
    }
    let path = Path::new(filename);
    let mut components = path.components();
    let only = components.next();
    if components.next().is_some() || !matches!(only, Some(std::path::Component::Normal(_))) {
        anyhow::bail!("invalid filename: {filename:?}");
    }
    if filename.contains('/') || filename.contains('\\') {
        anyhow::bail!("invalid filename: {filename:?}");
    }
    Ok(())
}

/// Stream a file and produce its manifest: size, chunk geometry and a
/// whole-file SHA-256 digest.
pub async fn build_manifest(path: &Path, chunk_size: u32) -> anyhow::Result<FileManifest> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("not a valid shared file path: {}", path.display()))?
        .to_string();

    let mut file = File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let total_size = file.metadata().await?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(FileManifest {
        filename,
        total_size,
        chunk_size,
        chunk_count: chunk_count(total_size, chunk_size),
        file_digest: hasher.finalize().into(),
    })
}

/// Read the chunk at `index` from a file on disk. Returns `Ok(None)`
/// when the file is missing or the index is past the end of the file.
pub async fn read_chunk(
    path: &Path,
    index: u32,
    chunk_size: u32,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
    };

    let total_size = file.metadata().await?.len();
    let start = index as u64 * chunk_size as u64;
    if total_size == 0 || start >= total_size {
        return Ok(None);
    }

    let len = expected_chunk_len(total_size, chunk_size, index);
    file.seek(SeekFrom::Start(start)).await?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Resolve a requested filename inside `dir`, refusing traversal.
pub fn shared_path(dir: &Path, filename: &str) -> anyhow::Result<PathBuf> {
    validate_no_traversal(filename)?;
    Ok(dir.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, data).await.expect("write");
        path
    }

    #[test]
    fn chunk_count_is_ceiling_division() {
        assert_eq!(chunk_count(0, 4), 0);
        assert_eq!(chunk_count(1, 4), 1);
        assert_eq!(chunk_count(4, 4), 1);
        assert_eq!(chunk_count(5, 4), 2);
        assert_eq!(chunk_count(8, 4), 2);
        assert_eq!(chunk_count(9, 4), 3);
    }

    #[test]
    fn final_chunk_carries_remainder() {
        assert_eq!(expected_chunk_len(10, 4, 0), 4);
        assert_eq!(expected_chunk_len(10, 4, 1), 4);
        assert_eq!(expected_chunk_len(10, 4, 2), 2);
    }

    #[test]
    fn traversal_names_are_rejected() {
        for bad in ["", "../etc/passwd", "a/b", "a\\b", "..", ".", "/abs"] {
            assert!(validate_no_traversal(bad).is_err(), "accepted {bad:?}");
        }
        assert!(validate_no_traversal("plain-name.bin").is_ok());
    }

    #[tokio::test]
    async fn manifest_matches_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data: Vec<u8> = (0u32..2500).map(|i| (i % 251) as u8).collect();
        let path = write_temp(&dir, "blob.bin", &data).await;

        let manifest = build_manifest(&path, 1024).await.expect("manifest");
        assert_eq!(manifest.filename, "blob.bin");
        assert_eq!(manifest.total_size, 2500);
        assert_eq!(manifest.chunk_count, 3);
        assert_eq!(
            manifest.file_digest,
            <[u8; 32]>::from(Sha256::digest(&data))
        );
    }

    #[tokio::test]
    async fn chunks_concatenate_to_original_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data: Vec<u8> = (0u32..3000).map(|i| (i % 256) as u8).collect();
        let path = write_temp(&dir, "blob.bin", &data).await;

        let mut assembled = Vec::new();
        for index in 0..chunk_count(data.len() as u64, 1024) {
            let chunk = read_chunk(&path, index, 1024)
                .await
                .expect("read")
                .expect("present");
            assert_eq!(chunk.len(), expected_chunk_len(data.len() as u64, 1024, index));
            assembled.extend_from_slice(&chunk);
        }
        assert_eq!(assembled, data);
    }

    #[tokio::test]
    async fn out_of_range_and_missing_reads_return_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp(&dir, "blob.bin", &[1, 2, 3]).await;

        assert!(read_chunk(&path, 1, 1024).await.expect("read").is_none());
        assert!(read_chunk(&dir.path().join("absent.bin"), 0, 1024)
            .await
            .expect("read")
            .is_none());
    }
}
