// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Peer-facing server: answers manifest and chunk requests over
//! encrypted sessions for files in the shared directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::Identity;
use crate::manifest::{build_manifest, read_chunk, shared_path};
use crate::session::{handshake_responder, SecureChannel};
use crate::wire::{
    self, Envelope, WirePayload, ERR_BAD_REQUEST, ERR_CHUNK_OUT_OF_RANGE, ERR_UNKNOWN_FILE,
    FLAG_ERROR, FLAG_RESPONSE,
};

pub struct PeerServer;

impl PeerServer {
    pub async fn start(
        identity: Arc<Identity>,
        shared_dir: PathBuf,
        chunk_size: u32,
        bind: SocketAddr,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding peer server on {bind}"))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, peer = %identity.peer_id().short(), "peer server listening");

        // identity is held by the accept loop only for logging; each
        // handshake authenticates the remote side, not us.
        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(%err, "peer server accept failed");
                        continue;
                    }
                };
                let shared_dir = shared_dir.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_peer(stream, remote, shared_dir, chunk_size).await {
                        debug!(%remote, %err, "peer connection ended");
                    }
                });
            }
        });

        Ok((local_addr, handle))
    }
}

async fn handle_peer(
    mut stream: TcpStream,
    remote: SocketAddr,
    shared_dir: PathBuf,
    chunk_size: u32,
) -> anyhow::Result<()> {
    let session = handshake_responder(&mut stream)
        .await
        .with_context(|| format!("handshake with {remote}"))?;
    if let Some(peer_id) = session.remote_peer_id() {
        debug!(%remote, peer = %peer_id.short(), "session established");
    }
    let mut channel = SecureChannel::new(stream, session);

    loop {
        let request = match channel.recv().await {
            Ok(envelope) => envelope,
            // Remote hung up; nothing to report.
            Err(_) => return Ok(()),
        };

        let (flags, reply) = match request.decode_typed() {
            Ok(payload) => answer(payload, &shared_dir, chunk_size).await,
            Err(err) => (
                FLAG_RESPONSE | FLAG_ERROR,
                WirePayload::error(ERR_BAD_REQUEST, err.to_string()),
            ),
        };
        // An error reply does not end the connection; the peer may
        // issue further valid requests on the same session.
        channel
            .send(&Envelope::from_typed(request.req_id, flags, &reply)?)
            .await?;
    }
}

async fn answer(
    payload: WirePayload,
    shared_dir: &PathBuf,
    chunk_size: u32,
) -> (u16, WirePayload) {
    match payload {
        WirePayload::Meta(msg) => match answer_meta(&msg.filename, shared_dir, chunk_size).await {
            Ok(reply) => (FLAG_RESPONSE, reply),
            Err((code, message)) => (
                FLAG_RESPONSE | FLAG_ERROR,
                WirePayload::error(code, message),
            ),
        },
        WirePayload::Get(msg) => {
            match answer_get(&msg.filename, msg.index, shared_dir, chunk_size).await {
                Ok(reply) => (FLAG_RESPONSE, reply),
                Err((code, message)) => (
                    FLAG_RESPONSE | FLAG_ERROR,
                    WirePayload::error(code, message),
                ),
            }
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

async fn answer_meta(
    filename: &str,
    shared_dir: &PathBuf,
    chunk_size: u32,
) -> Result<WirePayload, (u16, String)> {
    let path = shared_path(shared_dir, filename)
        .map_err(|err| (ERR_BAD_REQUEST, err.to_string()))?;
    if !path.is_file() {
        return Err((ERR_UNKNOWN_FILE, format!("no such shared file: {filename}")));
    }
    let manifest = build_manifest(&path, chunk_size)
        .await
        .map_err(|err| (ERR_UNKNOWN_FILE, format!("{err:#}")))?;
    Ok(WirePayload::MetaReply(wire::MetaReply {
        filename: manifest.filename,
        total_size: manifest.total_size,
        chunk_size: manifest.chunk_size,
        chunk_count: manifest.chunk_count,
        file_digest: manifest.file_digest,
    }))
}

async fn answer_get(
    filename: &str,
    index: u32,
    shared_dir: &PathBuf,
    chunk_size: u32,
) -> Result<WirePayload, (u16, String)> {
    let path = shared_path(shared_dir, filename)
        .map_err(|err| (ERR_BAD_REQUEST, err.to_string()))?;
    if !path.is_file() {
        return Err((ERR_UNKNOWN_FILE, format!("no such shared file: {filename}")));
    }
    match read_chunk(&path, index, chunk_size).await {
        Ok(Some(data)) => Ok(WirePayload::Chunk(wire::ChunkData {
            filename: filename.to_string(),
            index,
            data,
        })),
        Ok(None) => Err((
            ERR_CHUNK_OUT_OF_RANGE,
            format!("chunk {index} is out of range for {filename}"),
        )),
        Err(err) => Err((ERR_UNKNOWN_FILE, format!("{err:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::identity_a;
    use crate::session::handshake_initiator;
    use crate::wire::{Get, Meta};

    async fn start_server(shared_dir: PathBuf, chunk_size: u32) -> SocketAddr {
        let (addr, _task) = PeerServer::start(
            identity_a(),
            shared_dir,
            chunk_size,
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .expect("start server");
        addr
    }

    async fn connect(addr: SocketAddr) -> SecureChannel<TcpStream> {
        let identity = identity_a();
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let session = handshake_initiator(&mut stream, &identity)
            .await
            .expect("handshake");
        SecureChannel::new(stream, session)
    }

    #[tokio::test]
    async fn serves_manifest_and_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data: Vec<u8> = (0u32..300).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(dir.path().join("blob.bin"), &data)
            .await
            .expect("write");
        let addr = start_server(dir.path().to_path_buf(), 128).await;
        let mut channel = connect(addr).await;

        let reply = channel
            .request(&WirePayload::Meta(Meta {
                filename: "blob.bin".into(),
            }))
            .await
            .expect("meta");
        let WirePayload::MetaReply(meta) = reply else {
            panic!("wrong variant");
        };
        assert_eq!(meta.total_size, 300);
        assert_eq!(meta.chunk_count, 3);

        let reply = channel
            .request(&WirePayload::Get(Get {
                filename: "blob.bin".into(),
                index: 2,
            }))
            .await
            .expect("get");
        let WirePayload::Chunk(chunk) = reply else {
            panic!("wrong variant");
        };
        assert_eq!(chunk.data, &data[256..]);
    }

    #[tokio::test]
    async fn error_reply_keeps_the_connection_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("blob.bin"), vec![0u8; 100])
            .await
            .expect("write");
        let addr = start_server(dir.path().to_path_buf(), 64).await;
        let mut channel = connect(addr).await;

        // Out-of-range chunk request fails with a protocol error.
        let err = channel
            .request(&WirePayload::Get(Get {
                filename: "blob.bin".into(),
                index: 99,
            }))
            .await
            .expect_err("must fail");
        assert!(err
            .to_string()
            .contains(&format!("peer error {ERR_CHUNK_OUT_OF_RANGE}")));

        // The same session still answers a valid request afterwards.
        let reply = channel
            .request(&WirePayload::Get(Get {
                filename: "blob.bin".into(),
                index: 0,
            }))
            .await
            .expect("get after error");
        assert!(matches!(reply, WirePayload::Chunk(_)));
    }

    #[tokio::test]
    async fn unknown_file_and_traversal_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addr = start_server(dir.path().to_path_buf(), 64).await;
        let mut channel = connect(addr).await;

        let err = channel
            .request(&WirePayload::Meta(Meta {
                filename: "absent.bin".into(),
            }))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains(&format!("peer error {ERR_UNKNOWN_FILE}")));

        let err = channel
            .request(&WirePayload::Meta(Meta {
                filename: "../../etc/passwd".into(),
            }))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains(&format!("peer error {ERR_BAD_REQUEST}")));
    }
}
