// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use swarmdrop_core::registry::{Registry, RegistryServer, DEFAULT_TTL_SECS};
use swarmdrop_core::transfer::DownloadStatus;
use swarmdrop_core::{Identity, PeerConfig, PeerNode, RegistryClient};

#[derive(Parser)]
#[command(name = "swarmdrop")]
#[command(about = "Encrypted peer-to-peer file sharing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or print) the peer identity in a key directory.
    GenIdentity {
        #[arg(long, default_value = "keys")]
        key_dir: PathBuf,
    },
    /// Run a discovery registry.
    Registry {
        #[arg(long, default_value = "0.0.0.0:9400")]
        bind: SocketAddr,
        #[arg(long, default_value_t = DEFAULT_TTL_SECS)]
        ttl_secs: u64,
    },
    /// Run a peer node that shares the given directory.
    Serve {
        #[arg(long, default_value = "0.0.0.0:9410")]
        bind: SocketAddr,
        #[arg(long)]
        registry: Option<SocketAddr>,
        #[arg(long, default_value = "shared")]
        shared_dir: PathBuf,
        #[arg(long, default_value = "downloads")]
        downloads_dir: PathBuf,
        #[arg(long, default_value = "keys")]
        key_dir: PathBuf,
    },
    /// Download a file from a peer, located directly or via a registry.
    Fetch {
        filename: String,
        /// Peer address to fetch from; omit to look one up via --registry.
        #[arg(long)]
        peer: Option<SocketAddr>,
        #[arg(long)]
        registry: Option<SocketAddr>,
        #[arg(long, default_value = "downloads")]
        downloads_dir: PathBuf,
        #[arg(long, default_value = "keys")]
        key_dir: PathBuf,
    },
    /// List live peers known to a registry.
    Peers {
        #[arg(long)]
        registry: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::GenIdentity { key_dir } => {
            let identity = Identity::load_or_create(&key_dir)?;
            println!("peer_id: {}", identity.peer_id());
            println!("key_dir: {}", key_dir.display());
        }
        Command::Registry { bind, ttl_secs } => {
            let registry = Arc::new(tokio::sync::RwLock::new(Registry::new(ttl_secs)));
            let (addr, task) = RegistryServer::start(bind, registry).await?;
            println!("registry listening on {addr} (ttl {ttl_secs}s)");
            task.await?;
        }
        Command::Serve {
            bind,
            registry,
            shared_dir,
            downloads_dir,
            key_dir,
        } => {
            let config = PeerConfig {
                bind,
                registry_addr: registry,
                shared_dir,
                downloads_dir,
                key_dir,
                ..PeerConfig::default()
            };
            let node = PeerNode::start(config).await?;
            let status = node.status().await?;
            println!("peer {} listening on {}", status.peer_id, status.addr);
            for file in &status.shared_files {
                println!("  sharing {} ({} bytes)", file.name, file.size);
            }
            tokio::signal::ctrl_c().await?;
            node.shutdown();
        }
        Command::Fetch {
            filename,
            peer,
            registry,
            downloads_dir,
            key_dir,
        } => {
            let config = PeerConfig {
                bind: "127.0.0.1:0".parse()?,
                registry_addr: registry,
                downloads_dir: downloads_dir.clone(),
                key_dir,
                ..PeerConfig::default()
            };
            let node = PeerNode::start(config).await?;

            let peer_addr = match peer {
                Some(addr) => addr,
                None => {
                    let providers = node.find_peers_with_file(&filename).await?;
                    let provider = providers
                        .first()
                        .ok_or_else(|| anyhow::anyhow!("no peer shares {filename}"))?;
                    println!(
                        "found provider {} at {}:{}",
                        provider.peer_id, provider.ip, provider.port
                    );
                    SocketAddr::new(provider.ip, provider.port)
                }
            };

            let id = node.start_download(peer_addr, &filename).await?;
            loop {
                let progress = node
                    .progress(id)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("download vanished"))?;
                match progress.status {
                    DownloadStatus::Downloading => {
                        print!("\r{filename}: {}%", progress.progress_percent);
                        use std::io::Write;
                        std::io::stdout().flush()?;
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    DownloadStatus::Completed => {
                        println!("\r{filename}: done -> {}", downloads_dir.join(&filename).display());
                        break;
                    }
                    DownloadStatus::Failed => {
                        anyhow::bail!(
                            "download failed: {}",
                            progress.reason.unwrap_or_else(|| "unknown error".into())
                        );
                    }
                }
            }
            node.shutdown();
        }
        Command::Peers { registry } => {
            let peers = RegistryClient::new(registry).list_peers().await?;
            if peers.is_empty() {
                println!("no live peers");
            }
            for peer in peers {
                println!(
                    "{} {}:{} ({} files)",
                    peer.peer_id, peer.ip, peer.port, peer.file_count
                );
            }
        }
    }

    Ok(())
}
