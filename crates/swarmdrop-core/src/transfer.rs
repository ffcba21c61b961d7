// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunked download engine with bounded parallelism.
//!
//! Chunks are fetched through a [`PeerTransport`] with at most
//! `parallel_chunks` requests in flight; a new request is admitted only
//! when one completes. Any chunk failure fails the whole download.
//! Completed files are verified against the manifest digest before the
//! temp file is renamed into the downloads directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::identity::Identity;
use crate::manifest::{expected_chunk_len, validate_no_traversal, FileManifest};
use crate::session::{handshake_initiator, SecureChannel};
use crate::wire::{self, WirePayload};

#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Max chunk requests in flight for one download.
    pub parallel_chunks: usize,
    /// Per-request timeout, covering dial and handshake when a new
    /// connection is needed.
    pub request_timeout: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            parallel_chunks: 4,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Source of manifests and chunks for a download. The production
/// implementation talks to a remote peer over encrypted sessions.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn fetch_manifest(&self, filename: &str) -> anyhow::Result<FileManifest>;
    async fn fetch_chunk(&self, filename: &str, index: u32) -> anyhow::Result<Vec<u8>>;
}

/// Transport over TCP with a pool of established sessions. Parallel
/// chunk requests each use their own connection; a connection is
/// returned to the pool only after its request succeeds, so a failed
/// request never poisons later ones.
pub struct TcpPeerTransport {
    peer: SocketAddr,
    identity: Arc<Identity>,
    request_timeout: Duration,
    pool: Mutex<Vec<SecureChannel<TcpStream>>>,
}

impl TcpPeerTransport {
    pub fn new(peer: SocketAddr, identity: Arc<Identity>, request_timeout: Duration) -> Self {
        Self {
            peer,
            identity,
            request_timeout,
            pool: Mutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> anyhow::Result<SecureChannel<TcpStream>> {
        if let Some(channel) = self.pool.lock().await.pop() {
            return Ok(channel);
        }
        let mut stream = TcpStream::connect(self.peer)
            .await
            .with_context(|| format!("connecting to peer {}", self.peer))?;
        let session = handshake_initiator(&mut stream, &self.identity).await?;
        debug!(peer = %self.peer, "session established");
        Ok(SecureChannel::new(stream, session))
    }

    async fn request(&self, payload: &WirePayload) -> anyhow::Result<WirePayload> {
        // No retry: a failed request surfaces to the download, which
        // fails as a whole.
        tokio::time::timeout(self.request_timeout, async {
            let mut channel = self.checkout().await?;
            match channel.request(payload).await {
                Ok(reply) => {
                    self.pool.lock().await.push(channel);
                    Ok(reply)
                }
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("request to {} timed out", self.peer))?
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn fetch_manifest(&self, filename: &str) -> anyhow::Result<FileManifest> {
        let reply = self
            .request(&WirePayload::Meta(wire::Meta {
                filename: filename.to_string(),
            }))
            .await?;
        let WirePayload::MetaReply(meta) = reply else {
            anyhow::bail!("unexpected reply {:?} to manifest request", reply.msg_type());
        };
        Ok(FileManifest {
            filename: meta.filename,
            total_size: meta.total_size,
            chunk_size: meta.chunk_size,
            chunk_count: meta.chunk_count,
            file_digest: meta.file_digest,
        })
    }

    async fn fetch_chunk(&self, filename: &str, index: u32) -> anyhow::Result<Vec<u8>> {
        let reply = self
            .request(&WirePayload::Get(wire::Get {
                filename: filename.to_string(),
                index,
            }))
            .await?;
        let WirePayload::Chunk(chunk) = reply else {
            anyhow::bail!("unexpected reply {:?} to chunk request", reply.msg_type());
        };
        if chunk.filename != filename || chunk.index != index {
            anyhow::bail!(
                "chunk response mismatch: asked for {filename}#{index}, got {}#{}",
                chunk.filename,
                chunk.index
            );
        }
        Ok(chunk.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub filename: String,
    pub status: DownloadStatus,
    pub progress_percent: u8,
    /// Failure reason, present only when `status` is `Failed`.
    pub reason: Option<String>,
}

#[derive(Debug)]
struct DownloadJob {
    filename: String,
    status: DownloadStatus,
    completed_chunks: u32,
    chunk_count: Option<u32>,
    reason: Option<String>,
}

/// Shared view of a running or finished download.
#[derive(Debug, Clone)]
pub struct JobHandle(Arc<RwLock<DownloadJob>>);

impl JobHandle {
    pub fn new(filename: &str) -> Self {
        Self(Arc::new(RwLock::new(DownloadJob {
            filename: filename.to_string(),
            status: DownloadStatus::Downloading,
            completed_chunks: 0,
            chunk_count: None,
            reason: None,
        })))
    }

    pub async fn progress(&self) -> DownloadProgress {
        let job = self.0.read().await;
        let progress_percent = match (job.status, job.chunk_count) {
            (DownloadStatus::Completed, _) => 100,
            (_, Some(0)) => 100,
            (_, Some(total)) => ((job.completed_chunks as u64 * 100) / total as u64) as u8,
            (_, None) => 0,
        };
        DownloadProgress {
            filename: job.filename.clone(),
            status: job.status,
            progress_percent,
            reason: job.reason.clone(),
        }
    }

    async fn set_chunk_count(&self, count: u32) {
        self.0.write().await.chunk_count = Some(count);
    }

    async fn chunk_done(&self) {
        self.0.write().await.completed_chunks += 1;
    }

    async fn finish(&self, result: &anyhow::Result<()>) {
        let mut job = self.0.write().await;
        match result {
            Ok(()) => job.status = DownloadStatus::Completed,
            Err(err) => {
                job.status = DownloadStatus::Failed;
                job.reason = Some(format!("{err:#}"));
            }
        }
    }
}

/// Drive a download to completion, recording the outcome on `handle`.
pub async fn run_download(
    transport: Arc<dyn PeerTransport>,
    filename: String,
    downloads_dir: PathBuf,
    policy: TransferPolicy,
    handle: JobHandle,
) {
    let result = download_inner(transport, &filename, &downloads_dir, &policy, &handle).await;
    match &result {
        Ok(()) => info!(%filename, "download completed"),
        Err(err) => warn!(%filename, %err, "download failed"),
    }
    handle.finish(&result).await;
}

async fn download_inner(
    transport: Arc<dyn PeerTransport>,
    filename: &str,
    downloads_dir: &PathBuf,
    policy: &TransferPolicy,
    handle: &JobHandle,
) -> anyhow::Result<()> {
    validate_no_traversal(filename)?;

    let manifest = transport.fetch_manifest(filename).await?;
    if manifest.filename != filename {
        anyhow::bail!(
            "manifest is for {:?}, requested {filename:?}",
            manifest.filename
        );
    }
    if manifest.chunk_size == 0 {
        anyhow::bail!("manifest has zero chunk size");
    }
    let expected_count =
        crate::manifest::chunk_count(manifest.total_size, manifest.chunk_size);
    if manifest.chunk_count != expected_count {
        anyhow::bail!(
            "manifest chunk count {} does not match size {}",
            manifest.chunk_count,
            manifest.total_size
        );
    }
    handle.set_chunk_count(manifest.chunk_count).await;

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; manifest.chunk_count as usize];
    let window = policy.parallel_chunks.max(1);
    let mut next_index: u32 = 0;
    let mut in_flight = FuturesUnordered::new();

    let spawn_fetch = |index: u32| {
        let transport = transport.clone();
        let filename = filename.to_string();
        async move { (index, transport.fetch_chunk(&filename, index).await) }
    };

    while (next_index as usize) < slots.len() && in_flight.len() < window {
        in_flight.push(spawn_fetch(next_index));
        next_index += 1;
    }

    while let Some((index, result)) = in_flight.next().await {
        let data = result.with_context(|| format!("fetching chunk {index} of {filename}"))?;
        let expected =
            expected_chunk_len(manifest.total_size, manifest.chunk_size, index);
        if data.len() != expected {
            anyhow::bail!(
                "chunk {index} of {filename} has wrong length: {} instead of {expected}",
                data.len()
            );
        }
        slots[index as usize] = Some(data);
        handle.chunk_done().await;

        if (next_index as usize) < slots.len() {
            in_flight.push(spawn_fetch(next_index));
            next_index += 1;
        }
    }

    let mut hasher = Sha256::new();
    let mut assembled = Vec::with_capacity(manifest.total_size as usize);
    for slot in &slots {
        let chunk = slot.as_ref().context("download finished with missing chunk")?;
        hasher.update(chunk);
        assembled.extend_from_slice(chunk);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    if digest != manifest.file_digest {
        anyhow::bail!("integrity check failed");
    }

    tokio::fs::create_dir_all(downloads_dir)
        .await
        .with_context(|| format!("creating {}", downloads_dir.display()))?;
    let final_path = downloads_dir.join(filename);
    let temp_path = downloads_dir.join(format!(".{filename}.part"));
    tokio::fs::write(&temp_path, &assembled)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, &final_path)
        .await
        .with_context(|| format!("moving download into {}", final_path.display()))?;
    Ok(())
}
