// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handshake and per-connection encrypted session.
//!
//! The initiator sends HELLO with its peer ID and public key; the
//! responder verifies the ID against the key fingerprint, generates a
//! fresh AES-128 session key, and returns it sealed with RSA-OAEP.
//! From then on both sides exchange sealed envelopes only.

use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use anyhow::{anyhow, Context};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::{encrypt_session_key, Identity, PeerId};
use crate::transport::{read_envelope, read_sealed, write_envelope, write_sealed};
use crate::wire::{Envelope, WirePayload, FLAG_ERROR, FLAG_RESPONSE};

pub const SESSION_KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake progress, kept for diagnostics. A connection whose
/// handshake ends in `Failed` is never used for transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    HelloSent,
    SessionReceived,
    Established,
    Failed,
}

/// An established session: the negotiated key and, on the responder
/// side, the authenticated identity of the remote peer.
pub struct Session {
    remote_peer_id: Option<PeerId>,
    key: [u8; SESSION_KEY_LEN],
    cipher: Aes128Gcm,
}

impl Session {
    pub fn from_key(key: [u8; SESSION_KEY_LEN], remote_peer_id: Option<PeerId>) -> Self {
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key));
        Self {
            remote_peer_id,
            key,
            cipher,
        }
    }

    pub fn generate_key() -> [u8; SESSION_KEY_LEN] {
        let mut key = [0u8; SESSION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    #[cfg(test)]
    pub(crate) fn key_bytes(&self) -> [u8; SESSION_KEY_LEN] {
        self.key
    }

    /// Seal plaintext with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> anyhow::Result<([u8; NONCE_LEN], Vec<u8>)> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("session encryption failed"))?;
        Ok((nonce, ciphertext))
    }

    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("session decryption failed"))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_peer_id", &self.remote_peer_id)
            .finish_non_exhaustive()
    }
}

/// Run the initiator side of the handshake. Consumes the stream's
/// handshake phase; the returned session seals all further traffic.
pub async fn handshake_initiator<S>(io: &mut S, identity: &Identity) -> anyhow::Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = HandshakeState::Init;
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, initiator_steps(io, identity, &mut state))
        .await
        .map_err(|_| anyhow!("handshake timed out"))
        .and_then(|r| r);
    if result.is_err() {
        state = HandshakeState::Failed;
        tracing::debug!(?state, "initiator handshake failed");
    }
    result
}

async fn initiator_steps<S>(
    io: &mut S,
    identity: &Identity,
    state: &mut HandshakeState,
) -> anyhow::Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = WirePayload::Hello(crate::wire::Hello {
        peer_id: identity.peer_id(),
        public_key_der: identity.public_key_der().to_vec(),
    });
    write_envelope(io, &Envelope::from_typed(0, 0, &hello)?).await?;
    *state = HandshakeState::HelloSent;

    let reply = read_envelope(io).await.context("awaiting session key")?;
    if reply.flags & FLAG_ERROR != 0 {
        if let Ok(WirePayload::Error(err)) = reply.decode_typed() {
            anyhow::bail!("handshake rejected by peer: {}", err.message);
        }
        anyhow::bail!("handshake rejected by peer");
    }
    let WirePayload::SessionKey(session_key) = reply.decode_typed()? else {
        anyhow::bail!("unexpected handshake reply type {}", reply.r#type);
    };
    *state = HandshakeState::SessionReceived;

    let key_bytes = identity.decrypt_session_key(&session_key.encrypted_key)?;
    let key: [u8; SESSION_KEY_LEN] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("session key has wrong length: {}", key_bytes.len()))?;
    *state = HandshakeState::Established;
    Ok(Session::from_key(key, None))
}

/// Run the responder side of the handshake. Verifies that the claimed
/// peer ID matches the SHA-256 fingerprint of the presented key before
/// issuing a session key.
pub async fn handshake_responder<S>(io: &mut S) -> anyhow::Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = HandshakeState::Init;
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, responder_steps(io, &mut state))
        .await
        .map_err(|_| anyhow!("handshake timed out"))
        .and_then(|r| r);
    if result.is_err() {
        state = HandshakeState::Failed;
        tracing::debug!(?state, "responder handshake failed");
    }
    result
}

async fn responder_steps<S>(io: &mut S, state: &mut HandshakeState) -> anyhow::Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello_env = read_envelope(io).await.context("awaiting hello")?;
    let WirePayload::Hello(hello) = hello_env.decode_typed()? else {
        anyhow::bail!("expected hello, got type {}", hello_env.r#type);
    };

    let fingerprint = PeerId::from_public_key_der(&hello.public_key_der);
    if fingerprint != hello.peer_id {
        anyhow::bail!(
            "peer id does not match public key fingerprint (claimed {})",
            hello.peer_id.short()
        );
    }

    let key = Session::generate_key();
    let encrypted_key = encrypt_session_key(&hello.public_key_der, &key)?;
    let reply = WirePayload::SessionKey(crate::wire::SessionKey { encrypted_key });
    write_envelope(
        io,
        &Envelope::from_typed(hello_env.req_id, FLAG_RESPONSE, &reply)?,
    )
    .await?;

    *state = HandshakeState::Established;
    Ok(Session::from_key(key, Some(hello.peer_id)))
}

/// A stream plus its established session. All traffic through the
/// channel is sealed.
pub struct SecureChannel<S> {
    io: S,
    session: Session,
    next_req_id: u32,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, session: Session) -> Self {
        Self {
            io,
            session,
            next_req_id: 1,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        write_sealed(&mut self.io, &self.session, envelope).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<Envelope> {
        read_sealed(&mut self.io, &self.session).await
    }

    /// Send a request and wait for its matching response. An error
    /// reply from the peer is surfaced as an error here.
    pub async fn request(&mut self, payload: &WirePayload) -> anyhow::Result<WirePayload> {
        let req_id = self.next_req_id;
        self.next_req_id = self.next_req_id.wrapping_add(1);
        self.send(&Envelope::from_typed(req_id, 0, payload)?).await?;

        let reply = self.recv().await?;
        if reply.req_id != req_id {
            anyhow::bail!(
                "response req_id mismatch: expected {req_id}, got {}",
                reply.req_id
            );
        }
        let typed = reply.decode_typed()?;
        if reply.flags & FLAG_ERROR != 0 {
            if let WirePayload::Error(err) = &typed {
                anyhow::bail!("peer error {}: {}", err.code, err.message);
            }
            anyhow::bail!("peer returned error flag without error payload");
        }
        Ok(typed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::{identity_a, identity_b};
    use crate::wire::{Hello, SessionKey};

    #[tokio::test]
    async fn handshake_establishes_matching_sessions() {
        let identity = identity_a();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let responder = tokio::spawn(async move { handshake_responder(&mut b).await });
        let initiator_session = handshake_initiator(&mut a, &identity)
            .await
            .expect("initiator");
        let responder_session = responder.await.expect("join").expect("responder");

        assert_eq!(
            initiator_session.key_bytes(),
            responder_session.key_bytes()
        );
        assert_eq!(
            responder_session.remote_peer_id(),
            Some(identity.peer_id())
        );

        let (nonce, ct) = initiator_session.seal(b"ping").expect("seal");
        assert_eq!(responder_session.open(&nonce, &ct).expect("open"), b"ping");
    }

    #[tokio::test]
    async fn each_handshake_gets_a_fresh_key() {
        let identity = identity_a();
        let mut keys = Vec::new();
        for _ in 0..2 {
            let identity = identity.clone();
            let (mut a, mut b) = tokio::io::duplex(64 * 1024);
            let responder = tokio::spawn(async move { handshake_responder(&mut b).await });
            let session = handshake_initiator(&mut a, &identity)
                .await
                .expect("initiator");
            responder.await.expect("join").expect("responder");
            keys.push(session.key_bytes());
        }
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn responder_rejects_mismatched_peer_id() {
        let a_id = identity_a();
        let b_id = identity_b();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let responder = tokio::spawn(async move { handshake_responder(&mut server).await });

        // Claim A's peer id but present B's key.
        let hello = WirePayload::Hello(Hello {
            peer_id: a_id.peer_id(),
            public_key_der: b_id.public_key_der().to_vec(),
        });
        write_envelope(&mut client, &Envelope::from_typed(0, 0, &hello).unwrap())
            .await
            .expect("write hello");

        let err = responder.await.expect("join").expect_err("must reject");
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn initiator_rejects_garbage_session_key() {
        let identity = identity_a();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let fake_responder = tokio::spawn(async move {
            let _hello = read_envelope(&mut server).await.expect("hello");
            let reply = WirePayload::SessionKey(SessionKey {
                encrypted_key: vec![0u8; 256],
            });
            write_envelope(
                &mut server,
                &Envelope::from_typed(0, FLAG_RESPONSE, &reply).unwrap(),
            )
            .await
            .expect("reply");
        });

        let err = handshake_initiator(&mut client, &identity)
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("session key decryption failed"));
        fake_responder.await.expect("join");
    }
}
