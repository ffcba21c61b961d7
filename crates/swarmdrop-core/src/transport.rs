// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Length-prefixed framing over any async byte stream.
//!
//! Every message on the wire is a big-endian u32 length followed by that
//! many bytes. Handshake frames carry a plaintext CBOR [`Envelope`];
//! once a session is established frames carry a [`SealedFrame`] whose
//! ciphertext is an AES-GCM sealed envelope.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::{Session, NONCE_LEN};
use crate::wire::{Envelope, MAX_ENVELOPE_BYTES};

/// A sealed frame: random nonce plus AES-GCM ciphertext (tag included)
/// of a serialized envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedFrame {
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

pub(crate) async fn write_frame<S>(io: &mut S, bytes: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_ENVELOPE_BYTES {
        anyhow::bail!(
            "refusing to send oversized frame: {} > {}",
            bytes.len(),
            MAX_ENVELOPE_BYTES
        );
    }
    io.write_u32(bytes.len() as u32).await?;
    io.write_all(bytes).await?;
    io.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<S>(io: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await.context("connection closed")? as usize;
    if len > MAX_ENVELOPE_BYTES {
        anyhow::bail!("incoming frame exceeds max size: {len} > {MAX_ENVELOPE_BYTES}");
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a plaintext envelope. Only valid during the handshake.
pub async fn write_envelope<S>(io: &mut S, envelope: &Envelope) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_frame(io, &envelope.encode()?).await
}

/// Read a plaintext envelope. Only valid during the handshake.
pub async fn read_envelope<S>(io: &mut S) -> anyhow::Result<Envelope>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_frame(io).await?;
    Envelope::decode(&bytes)
}

/// Seal an envelope under the session key and write it.
pub async fn write_sealed<S>(io: &mut S, session: &Session, envelope: &Envelope) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (nonce, ciphertext) = session.seal(&envelope.encode()?)?;
    let frame = SealedFrame { nonce, ciphertext };
    write_frame(io, &crate::wire::to_cbor(&frame)?).await
}

/// Read a sealed frame and open it under the session key.
pub async fn read_sealed<S>(io: &mut S, session: &Session) -> anyhow::Result<Envelope>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_frame(io).await?;
    let frame: SealedFrame = crate::wire::from_cbor(&bytes)?;
    let plaintext = session.open(&frame.nonce, &frame.ciphertext)?;
    Envelope::decode(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Meta, MsgType, WirePayload};

    #[tokio::test]
    async fn plaintext_envelope_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let env = Envelope::from_typed(
            1,
            0,
            &WirePayload::Meta(Meta {
                filename: "notes.txt".into(),
            }),
        )
        .expect("envelope");

        write_envelope(&mut a, &env).await.expect("write");
        let got = read_envelope(&mut b).await.expect("read");
        assert_eq!(got.r#type, MsgType::Meta as u16);
        assert_eq!(got.req_id, 1);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_alloc() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_u32(&mut a, u32::MAX)
            .await
            .expect("write len");
        let err = read_frame(&mut b).await.expect_err("must reject");
        assert!(err.to_string().contains("exceeds max size"));
    }

    #[tokio::test]
    async fn sealed_roundtrip_and_tamper_detection() {
        let session = Session::from_key(Session::generate_key(), None);
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let env = Envelope::from_typed(
            9,
            0,
            &WirePayload::Meta(Meta {
                filename: "notes.txt".into(),
            }),
        )
        .expect("envelope");

        write_sealed(&mut a, &session, &env).await.expect("write");
        let got = read_sealed(&mut b, &session).await.expect("read");
        assert_eq!(got.req_id, 9);

        // Flip a ciphertext byte and the open must fail.
        let (nonce, mut ciphertext) = session.seal(&env.encode().expect("encode")).expect("seal");
        ciphertext[0] ^= 0x80;
        let frame = SealedFrame { nonce, ciphertext };
        write_frame(&mut a, &crate::wire::to_cbor(&frame).expect("cbor"))
            .await
            .expect("write");
        assert!(read_sealed(&mut b, &session).await.is_err());
    }
}
