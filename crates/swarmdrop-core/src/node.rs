// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Peer node façade: ties identity, server, discovery and the download
//! engine together behind one handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::identity::{Identity, PeerId};
use crate::manifest::validate_no_traversal;
use crate::registry::RegistryClient;
use crate::server::PeerServer;
use crate::transfer::{
    run_download, DownloadProgress, JobHandle, PeerTransport, TcpPeerTransport,
};
use crate::wire::PeerEndpoint;

pub type DownloadId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub registry_addr: Option<SocketAddr>,
    pub shared_files: Vec<SharedFile>,
    pub downloads: usize,
}

#[derive(Default)]
struct NodeState {
    downloads: HashMap<DownloadId, JobHandle>,
    next_download_id: DownloadId,
}

pub struct PeerNode;

impl PeerNode {
    /// Load or create the node identity and bring the peer up.
    pub async fn start(config: PeerConfig) -> anyhow::Result<PeerHandle> {
        let identity = Arc::new(Identity::load_or_create(&config.key_dir)?);
        Self::start_with_identity(config, identity).await
    }

    pub async fn start_with_identity(
        config: PeerConfig,
        identity: Arc<Identity>,
    ) -> anyhow::Result<PeerHandle> {
        tokio::fs::create_dir_all(&config.shared_dir)
            .await
            .with_context(|| format!("creating {}", config.shared_dir.display()))?;
        tokio::fs::create_dir_all(&config.downloads_dir)
            .await
            .with_context(|| format!("creating {}", config.downloads_dir.display()))?;

        let (local_addr, server_task) = PeerServer::start(
            identity.clone(),
            config.shared_dir.clone(),
            config.chunk_size,
            config.bind,
        )
        .await?;
        info!(peer = %identity.peer_id().short(), %local_addr, "peer node started");

        let heartbeat_task = config.registry_addr.map(|registry_addr| {
            let identity = identity.clone();
            let shared_dir = config.shared_dir.clone();
            let interval = config.heartbeat_interval;
            let port = local_addr.port();
            tokio::spawn(async move {
                let client = RegistryClient::new(registry_addr);
                loop {
                    let files = match list_shared(&shared_dir).await {
                        Ok(files) => files.into_iter().map(|f| f.name).collect(),
                        Err(err) => {
                            warn!(%err, "cannot scan shared directory");
                            Vec::new()
                        }
                    };
                    // The registry upgrades a heartbeat from an unknown
                    // peer to a registration, so one call covers both
                    // first contact and refresh.
                    if let Err(err) = client
                        .heartbeat(identity.peer_id(), port, files)
                        .await
                    {
                        warn!(%err, "discovery unavailable");
                    }
                    tokio::time::sleep(interval).await;
                }
            })
        });

        Ok(PeerHandle {
            identity,
            config,
            local_addr,
            state: Arc::new(RwLock::new(NodeState::default())),
            server_task,
            heartbeat_task,
        })
    }
}

pub struct PeerHandle {
    identity: Arc<Identity>,
    config: PeerConfig,
    local_addr: SocketAddr,
    state: Arc<RwLock<NodeState>>,
    server_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn status(&self) -> anyhow::Result<PeerStatus> {
        Ok(PeerStatus {
            peer_id: self.identity.peer_id(),
            addr: self.local_addr,
            registry_addr: self.config.registry_addr,
            shared_files: self.shared_files().await?,
            downloads: self.state.read().await.downloads.len(),
        })
    }

    pub async fn shared_files(&self) -> anyhow::Result<Vec<SharedFile>> {
        list_shared(&self.config.shared_dir).await
    }

    /// Place a file in the shared directory, making it available to
    /// other peers under `name`.
    pub async fn upload(&self, bytes: &[u8], name: &str) -> anyhow::Result<SharedFile> {
        validate_no_traversal(name)?;
        let target = self.config.shared_dir.join(name);
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        info!(%name, size = bytes.len(), "file shared");
        Ok(SharedFile {
            name: name.to_string(),
            size: bytes.len() as u64,
        })
    }

    /// Share an existing local file under its bare filename.
    pub async fn upload_file(&self, source: &Path) -> anyhow::Result<SharedFile> {
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("not a shareable path: {}", source.display()))?
            .to_string();
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        self.upload(&bytes, &name).await
    }

    /// Stop sharing a file. Returns `false` when it was not shared.
    pub async fn delete_shared(&self, name: &str) -> anyhow::Result<bool> {
        validate_no_traversal(name)?;
        match tokio::fs::remove_file(self.config.shared_dir.join(name)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Ask the registry which live peers advertise `filename`.
    pub async fn find_peers_with_file(
        &self,
        filename: &str,
    ) -> anyhow::Result<Vec<PeerEndpoint>> {
        let registry_addr = self
            .config
            .registry_addr
            .context("no discovery registry configured")?;
        RegistryClient::new(registry_addr)
            .find_peers_with_file(filename)
            .await
    }

    /// Start downloading `filename` from a specific peer. Returns
    /// immediately; poll [`progress`](Self::progress) for the outcome.
    pub async fn start_download(
        &self,
        peer: SocketAddr,
        filename: &str,
    ) -> anyhow::Result<DownloadId> {
        validate_no_traversal(filename)?;
        let transport: Arc<dyn PeerTransport> = Arc::new(TcpPeerTransport::new(
            peer,
            self.identity.clone(),
            self.config.transfer.request_timeout,
        ));
        let handle = JobHandle::new(filename);

        let id = {
            let mut state = self.state.write().await;
            let id = state.next_download_id;
            state.next_download_id += 1;
            state.downloads.insert(id, handle.clone());
            id
        };

        tokio::spawn(run_download(
            transport,
            filename.to_string(),
            self.config.downloads_dir.clone(),
            self.config.transfer.clone(),
            handle,
        ));
        Ok(id)
    }

    /// Progress of one download, or `None` for an unknown id. Finished
    /// jobs stay queryable.
    pub async fn progress(&self, id: DownloadId) -> Option<DownloadProgress> {
        let handle = self.state.read().await.downloads.get(&id).cloned()?;
        Some(handle.progress().await)
    }

    pub async fn list_downloads(&self) -> Vec<(DownloadId, DownloadProgress)> {
        let handles: Vec<_> = {
            let state = self.state.read().await;
            state
                .downloads
                .iter()
                .map(|(id, handle)| (*id, handle.clone()))
                .collect()
        };
        let mut progress = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            progress.push((id, handle.progress().await));
        }
        progress.sort_by_key(|(id, _)| *id);
        progress
    }

    pub fn shutdown(self) {
        self.server_task.abort();
        if let Some(task) = self.heartbeat_task {
            task.abort();
        }
    }
}

async fn list_shared(dir: &Path) -> anyhow::Result<Vec<SharedFile>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        files.push(SharedFile {
            name,
            size: metadata.len(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::{identity_a, identity_b};
    use crate::registry::{Registry, RegistryServer, DEFAULT_TTL_SECS};
    use crate::transfer::{DownloadStatus, TransferPolicy};
    use std::time::Duration;

    async fn node_with(
        identity: Arc<Identity>,
        registry_addr: Option<SocketAddr>,
        chunk_size: u32,
        root: &Path,
    ) -> PeerHandle {
        let config = PeerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            registry_addr,
            shared_dir: root.join("shared"),
            downloads_dir: root.join("downloads"),
            key_dir: root.join("keys"),
            heartbeat_interval: Duration::from_millis(50),
            chunk_size,
            transfer: TransferPolicy {
                parallel_chunks: 4,
                request_timeout: Duration::from_secs(5),
            },
        };
        PeerNode::start_with_identity(config, identity)
            .await
            .expect("start node")
    }

    async fn wait_for_terminal(node: &PeerHandle, id: DownloadId) -> DownloadProgress {
        for _ in 0..200 {
            let progress = node.progress(id).await.expect("known download");
            if progress.status != DownloadStatus::Downloading {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download did not finish");
    }

    #[tokio::test]
    async fn file_transfers_between_two_nodes() {
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        // Small chunks so a 10-chunk transfer exercises the window.
        let seeder = node_with(identity_a(), None, 512, dir_a.path()).await;
        let leecher = node_with(identity_b(), None, 512, dir_b.path()).await;

        let data: Vec<u8> = (0u32..10 * 512).map(|i| (i % 241) as u8).collect();
        let source = dir_a.path().join("dataset.bin");
        tokio::fs::write(&source, &data).await.expect("write");
        let shared = seeder.upload_file(&source).await.expect("upload");
        assert_eq!(shared.size, data.len() as u64);

        let id = leecher
            .start_download(seeder.local_addr(), "dataset.bin")
            .await
            .expect("start download");
        let progress = wait_for_terminal(&leecher, id).await;
        assert_eq!(progress.status, DownloadStatus::Completed, "{:?}", progress.reason);

        let fetched = tokio::fs::read(dir_b.path().join("downloads").join("dataset.bin"))
            .await
            .expect("read download");
        assert_eq!(fetched, data);

        seeder.shutdown();
        leecher.shutdown();
    }

    #[tokio::test]
    async fn download_of_unshared_file_fails() {
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let seeder = node_with(identity_a(), None, 512, dir_a.path()).await;
        let leecher = node_with(identity_b(), None, 512, dir_b.path()).await;

        let id = leecher
            .start_download(seeder.local_addr(), "absent.bin")
            .await
            .expect("start download");
        let progress = wait_for_terminal(&leecher, id).await;
        assert_eq!(progress.status, DownloadStatus::Failed);
        assert!(progress.reason.expect("reason").contains("no such shared file"));

        seeder.shutdown();
        leecher.shutdown();
    }

    #[tokio::test]
    async fn nodes_announce_files_through_the_registry() {
        let registry = Arc::new(RwLock::new(Registry::new(DEFAULT_TTL_SECS)));
        let (registry_addr, registry_task) =
            RegistryServer::start("127.0.0.1:0".parse().unwrap(), registry)
                .await
                .expect("start registry");

        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let seeder = node_with(identity_a(), Some(registry_addr), 512, dir_a.path()).await;
        let leecher = node_with(identity_b(), Some(registry_addr), 512, dir_b.path()).await;

        let source = dir_a.path().join("notes.txt");
        tokio::fs::write(&source, b"hello swarm").await.expect("write");
        seeder.upload_file(&source).await.expect("upload");

        // Wait for a heartbeat carrying the new file list.
        let mut providers = Vec::new();
        for _ in 0..100 {
            providers = leecher
                .find_peers_with_file("notes.txt")
                .await
                .unwrap_or_default();
            if !providers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, seeder.peer_id());
        assert_eq!(providers[0].port, seeder.local_addr().port());

        let peer_addr = SocketAddr::new(providers[0].ip, providers[0].port);
        let id = leecher
            .start_download(peer_addr, "notes.txt")
            .await
            .expect("start download");
        let progress = wait_for_terminal(&leecher, id).await;
        assert_eq!(progress.status, DownloadStatus::Completed, "{:?}", progress.reason);

        seeder.shutdown();
        leecher.shutdown();
        registry_task.abort();
    }

    #[tokio::test]
    async fn delete_shared_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = node_with(identity_a(), None, 512, dir.path()).await;

        let source = dir.path().join("temp.bin");
        tokio::fs::write(&source, b"x").await.expect("write");
        node.upload_file(&source).await.expect("upload");
        assert_eq!(node.shared_files().await.expect("list").len(), 1);

        assert!(node.delete_shared("temp.bin").await.expect("delete"));
        assert!(!node.delete_shared("temp.bin").await.expect("delete"));
        assert!(node.shared_files().await.expect("list").is_empty());

        node.shutdown();
    }
}
