// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery registry: tracks live peers and which files they share.
//!
//! The registry speaks the same length-prefixed envelope protocol as
//! peers but unencrypted; it stores advertised metadata only and never
//! proxies file content. Expiry is lazy: stale records are dropped when
//! a read observes them, against the caller-supplied clock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::transport::{read_envelope, write_envelope};
use crate::wire::{
    self, Envelope, WirePayload, ERR_BAD_REQUEST, FLAG_ERROR, FLAG_RESPONSE,
};

pub const DEFAULT_TTL_SECS: u64 = 90;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    pub files: Vec<String>,
    pub last_heartbeat_unix: u64,
}

impl RegistryRecord {
    fn is_live(&self, now_unix: u64, ttl_secs: u64) -> bool {
        now_unix.saturating_sub(self.last_heartbeat_unix) <= ttl_secs
    }
}

#[derive(Debug)]
pub struct Registry {
    ttl_secs: u64,
    records: HashMap<PeerId, RegistryRecord>,
}

impl Registry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            records: HashMap::new(),
        }
    }

    /// Insert or fully replace a peer record.
    pub fn register(
        &mut self,
        peer_id: PeerId,
        ip: IpAddr,
        port: u16,
        files: Vec<String>,
        now_unix: u64,
    ) {
        self.records.insert(
            peer_id,
            RegistryRecord {
                peer_id,
                ip,
                port,
                files,
                last_heartbeat_unix: now_unix,
            },
        );
    }

    /// Refresh a known peer's liveness and file list. Returns `false`
    /// for an unknown peer; callers decide whether to fall back to a
    /// full registration.
    pub fn heartbeat(
        &mut self,
        peer_id: &PeerId,
        files: Vec<String>,
        now_unix: u64,
    ) -> bool {
        match self.records.get_mut(peer_id) {
            Some(record) => {
                record.last_heartbeat_unix = now_unix;
                record.files = files;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        self.records.remove(peer_id).is_some()
    }

    /// All live peers, dropping expired records as a side effect.
    pub fn list_peers(&mut self, now_unix: u64) -> Vec<RegistryRecord> {
        self.expire(now_unix);
        let mut peers: Vec<_> = self.records.values().cloned().collect();
        peers.sort_by_key(|record| record.peer_id.0);
        peers
    }

    /// Live peers advertising `filename`.
    pub fn find_peers_with_file(&mut self, filename: &str, now_unix: u64) -> Vec<RegistryRecord> {
        self.expire(now_unix);
        let mut peers: Vec<_> = self
            .records
            .values()
            .filter(|record| record.files.iter().any(|f| f == filename))
            .cloned()
            .collect();
        peers.sort_by_key(|record| record.peer_id.0);
        peers
    }

    fn expire(&mut self, now_unix: u64) {
        let ttl = self.ttl_secs;
        self.records.retain(|_, record| record.is_live(now_unix, ttl));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The registry's network face: a TCP accept loop answering discovery
/// envelopes.
pub struct RegistryServer;

impl RegistryServer {
    pub async fn start(
        bind: SocketAddr,
        registry: Arc<RwLock<Registry>>,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding registry on {bind}"))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "registry listening");

        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(%err, "registry accept failed");
                        continue;
                    }
                };
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, remote, registry).await {
                        debug!(%remote, %err, "registry connection ended");
                    }
                });
            }
        });

        Ok((local_addr, handle))
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    registry: Arc<RwLock<Registry>>,
) -> anyhow::Result<()> {
    loop {
        let request = match read_envelope(&mut stream).await {
            Ok(envelope) => envelope,
            // Peers close after each request; a clean EOF is not an error.
            Err(_) => return Ok(()),
        };

        let (flags, reply) = match request.decode_typed() {
            Ok(payload) => handle_request(payload, remote, &registry).await,
            Err(err) => (
                FLAG_RESPONSE | FLAG_ERROR,
                WirePayload::error(ERR_BAD_REQUEST, err.to_string()),
            ),
        };
        write_envelope(
            &mut stream,
            &Envelope::from_typed(request.req_id, flags, &reply)?,
        )
        .await?;
    }
}

async fn handle_request(
    payload: WirePayload,
    remote: SocketAddr,
    registry: &Arc<RwLock<Registry>>,
) -> (u16, WirePayload) {
    let now = now_unix_secs();
    match payload {
        WirePayload::Register(msg) => {
            let mut registry = registry.write().await;
            debug!(peer = %msg.peer_id.short(), port = msg.port, files = msg.files.len(), "register");
            registry.register(msg.peer_id, remote.ip(), msg.port, msg.files, now);
            (
                FLAG_RESPONSE,
                WirePayload::Registered(wire::Registered {
                    peer_id: msg.peer_id,
                    ip: remote.ip(),
                    port: msg.port,
                }),
            )
        }
        WirePayload::Heartbeat(msg) => {
            let mut registry = registry.write().await;
            let refreshed = registry.heartbeat(&msg.peer_id, msg.files.clone(), now);
            if !refreshed {
                // Heartbeat from a peer we expired or never saw:
                // treat it as a registration so peers self-heal after
                // a registry restart.
                debug!(peer = %msg.peer_id.short(), "heartbeat from unknown peer, registering");
                registry.register(msg.peer_id, remote.ip(), msg.port, msg.files, now);
            }
            (
                FLAG_RESPONSE,
                WirePayload::HeartbeatAck(wire::HeartbeatAck { refreshed }),
            )
        }
        WirePayload::ListPeers(_) => {
            let mut registry = registry.write().await;
            let peers = registry
                .list_peers(now)
                .into_iter()
                .map(|record| wire::PeerSummary {
                    peer_id: record.peer_id,
                    ip: record.ip,
                    port: record.port,
                    file_count: record.files.len() as u32,
                })
                .collect();
            (FLAG_RESPONSE, WirePayload::PeerList(wire::PeerList { peers }))
        }
        WirePayload::FindFile(msg) => {
            let mut registry = registry.write().await;
            let peers: Vec<_> = registry
                .find_peers_with_file(&msg.filename, now)
                .into_iter()
                .map(|record| wire::PeerEndpoint {
                    peer_id: record.peer_id,
                    ip: record.ip,
                    port: record.port,
                })
                .collect();
            (
                FLAG_RESPONSE,
                WirePayload::FileProviders(wire::FileProviders {
                    found_count: peers.len() as u32,
                    filename: msg.filename,
                    peers,
                }),
            )
        }
        other => (
            FLAG_RESPONSE | FLAG_ERROR,
            WirePayload::error(
                ERR_BAD_REQUEST,
                format!("unexpected message type {:?}", other.msg_type()),
            ),
        ),
    }
}

/// Client side of the discovery protocol. Opens one connection per
/// request; discovery traffic is rare enough that pooling buys nothing.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(10),
        }
    }

    pub async fn register(
        &self,
        peer_id: PeerId,
        port: u16,
        files: Vec<String>,
    ) -> anyhow::Result<wire::Registered> {
        let reply = self
            .roundtrip(&WirePayload::Register(wire::Register {
                peer_id,
                port,
                files,
            }))
            .await?;
        match reply {
            WirePayload::Registered(ack) => Ok(ack),
            other => anyhow::bail!("unexpected registry reply {:?}", other.msg_type()),
        }
    }

    pub async fn heartbeat(
        &self,
        peer_id: PeerId,
        port: u16,
        files: Vec<String>,
    ) -> anyhow::Result<wire::HeartbeatAck> {
        let reply = self
            .roundtrip(&WirePayload::Heartbeat(wire::Heartbeat {
                peer_id,
                port,
                files,
            }))
            .await?;
        match reply {
            WirePayload::HeartbeatAck(ack) => Ok(ack),
            other => anyhow::bail!("unexpected registry reply {:?}", other.msg_type()),
        }
    }

    pub async fn list_peers(&self) -> anyhow::Result<Vec<wire::PeerSummary>> {
        let reply = self
            .roundtrip(&WirePayload::ListPeers(wire::ListPeers {}))
            .await?;
        match reply {
            WirePayload::PeerList(list) => Ok(list.peers),
            other => anyhow::bail!("unexpected registry reply {:?}", other.msg_type()),
        }
    }

    pub async fn find_peers_with_file(
        &self,
        filename: &str,
    ) -> anyhow::Result<Vec<wire::PeerEndpoint>> {
        let reply = self
            .roundtrip(&WirePayload::FindFile(wire::FindFile {
                filename: filename.to_string(),
            }))
            .await?;
        match reply {
            WirePayload::FileProviders(providers) => Ok(providers.peers),
            other => anyhow::bail!("unexpected registry reply {:?}", other.msg_type()),
        }
    }

    async fn roundtrip(&self, payload: &WirePayload) -> anyhow::Result<WirePayload> {
        tokio::time::timeout(self.timeout, self.roundtrip_inner(payload))
            .await
            .map_err(|_| anyhow::anyhow!("discovery unavailable: request timed out"))?
    }

    async fn roundtrip_inner(&self, payload: &WirePayload) -> anyhow::Result<WirePayload> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .with_context(|| format!("discovery unavailable at {}", self.addr))?;
        write_envelope(&mut stream, &Envelope::from_typed(1, 0, payload)?).await?;
        let reply = read_envelope(&mut stream).await?;
        let typed = reply.decode_typed()?;
        if reply.flags & FLAG_ERROR != 0 {
            if let WirePayload::Error(err) = &typed {
                anyhow::bail!("registry error {}: {}", err.code, err.message);
            }
            anyhow::bail!("registry returned error flag without error payload");
        }
        Ok(typed)
    }
}
