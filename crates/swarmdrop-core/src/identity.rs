// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Long-lived peer identity: an RSA-2048 keypair on disk and the peer ID
//! derived from it.
//!
//! The peer ID is the SHA-256 fingerprint of the DER-encoded public key,
//! so it is stable across restarts for as long as the key files persist
//! and two peers only collide if they share a key.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PRIVATE_KEY_FILE: &str = "private_key.pem";
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

const RSA_BITS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_public_key_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Leading eight bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

pub struct Identity {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
    peer_id: PeerId,
}

impl Identity {
    /// Load the keypair under `dir`, or generate and persist a fresh one if
    /// none exists yet.
    ///
    /// A private key file that is present but unreadable or corrupt is a
    /// fatal error: regenerating over it would silently change this peer's
    /// identity.
    pub fn load_or_create(dir: &Path) -> anyhow::Result<Self> {
        let private_path = dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            let pem = std::fs::read_to_string(&private_path)
                .with_context(|| format!("unable to read {}", private_path.display()))?;
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .with_context(|| format!("corrupt private key at {}", private_path.display()))?;
            return Self::from_private_key(private_key);
        }

        let identity = Self::generate()?;
        identity.save(dir)?;
        Ok(identity)
    }

    /// Generate a fresh in-memory identity without touching disk.
    pub fn generate() -> anyhow::Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key =
            RsaPrivateKey::new(&mut rng, RSA_BITS).context("RSA keypair generation failed")?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> anyhow::Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_der = public_key
            .to_public_key_der()
            .context("encode public key")?
            .as_bytes()
            .to_vec();
        let peer_id = PeerId::from_public_key_der(&public_key_der);
        Ok(Self {
            private_key,
            public_key_der,
            peer_id,
        })
    }

    /// Persist both halves of the keypair as PEM under `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create key directory {}", dir.display()))?;
        let private_pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("encode private key")?;
        std::fs::write(dir.join(PRIVATE_KEY_FILE), private_pem.as_bytes())?;
        let public_pem = RsaPublicKey::from(&self.private_key)
            .to_public_key_pem(LineEnding::LF)
            .context("encode public key")?;
        std::fs::write(dir.join(PUBLIC_KEY_FILE), public_pem.as_bytes())?;
        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Exportable public key for the HELLO message.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Recover a session key that was sealed to our public key.
    pub fn decrypt_session_key(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .context("session key decryption failed")
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id.to_string())
            .finish_non_exhaustive()
    }
}

/// Seal a fresh session key to a remote peer's public key (RSA-OAEP with
/// SHA-256). Asymmetric crypto is used exactly once per connection, here.
pub fn encrypt_session_key(public_key_der: &[u8], key: &[u8]) -> anyhow::Result<Vec<u8>> {
    let public_key =
        RsaPublicKey::from_public_key_der(public_key_der).context("malformed peer public key")?;
    let mut rng = rand::rngs::OsRng;
    public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), key)
        .context("session key encryption failed")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_a_pure_function_of_the_public_key() {
        let identity = test_support::identity_a();
        let recomputed = PeerId::from_public_key_der(identity.public_key_der());
        assert_eq!(identity.peer_id(), recomputed);
        assert_ne!(identity.peer_id(), test_support::identity_b().peer_id());
    }

    #[test]
    fn save_then_load_preserves_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = test_support::identity_a();
        original.save(dir.path()).expect("save keypair");

        let reloaded = Identity::load_or_create(dir.path()).expect("load keypair");
        assert_eq!(reloaded.peer_id(), original.peer_id());
        assert_eq!(reloaded.public_key_der(), original.public_key_der());
    }

    #[test]
    fn corrupt_private_key_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), b"not a pem").expect("write");

        let err = Identity::load_or_create(dir.path()).expect_err("must refuse corrupt key");
        assert!(err.to_string().contains("corrupt private key"));
    }

    #[test]
    fn session_key_roundtrip_through_rsa() {
        let identity = test_support::identity_a();
        let key = [7u8; 16];
        let sealed = encrypt_session_key(identity.public_key_der(), &key).expect("encrypt");
        let opened = identity.decrypt_session_key(&sealed).expect("decrypt");
        assert_eq!(opened, key);

        let other = test_support::identity_b();
        other
            .decrypt_session_key(&sealed)
            .expect_err("wrong private key must fail");
    }
}
