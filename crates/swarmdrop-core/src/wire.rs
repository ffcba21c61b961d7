// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::convert::TryFrom;
use std::net::IpAddr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::PeerId;

/// Serialize `value` into a CBOR byte vector.
pub fn to_cbor<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Deserialize `T` from a CBOR byte slice.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: u16,
    pub req_id: u32,
    pub flags: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

pub const FLAG_RESPONSE: u16 = 0x0001;
pub const FLAG_ERROR: u16 = 0x0002;

/// Upper bound for a serialized envelope accepted from the wire.
pub const MAX_ENVELOPE_BYTES: usize = 2 * 1024 * 1024;
/// Upper bound for a decoded payload: one full chunk plus codec overhead.
pub const MAX_ENVELOPE_PAYLOAD_BYTES: usize = 1024 * 1024 + 4096;

impl Envelope {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            anyhow::bail!(
                "envelope exceeds max size: {} > {}",
                bytes.len(),
                MAX_ENVELOPE_BYTES
            );
        }
        let envelope: Self = from_cbor(bytes)?;
        if envelope.payload.len() > MAX_ENVELOPE_PAYLOAD_BYTES {
            anyhow::bail!(
                "envelope payload exceeds max size: {} > {}",
                envelope.payload.len(),
                MAX_ENVELOPE_PAYLOAD_BYTES
            );
        }
        Ok(envelope)
    }

    /// Decode the envelope payload into a typed protocol message.
    pub fn decode_typed(&self) -> anyhow::Result<WirePayload> {
        WirePayload::decode(self.r#type, &self.payload)
    }

    /// Build an envelope from a typed protocol payload.
    pub fn from_typed(req_id: u32, flags: u16, payload: &WirePayload) -> anyhow::Result<Self> {
        Ok(Self {
            r#type: u16::from(payload.msg_type()),
            req_id,
            flags,
            payload: payload.encode()?,
        })
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Handshake opener: initiator's peer ID and public key.
    Hello = 100,
    /// Handshake reply: the session key sealed to the initiator.
    SessionKey = 101,
    /// Manifest request for a named file.
    Meta = 200,
    /// Manifest response.
    MetaReply = 201,
    /// Chunk request by filename and index.
    Get = 210,
    /// Chunk payload response.
    Chunk = 211,
    /// Registry: advertise this peer and its file list.
    Register = 300,
    /// Registry: registration acknowledgement.
    Registered = 301,
    /// Registry: liveness refresh, same shape as Register.
    Heartbeat = 302,
    /// Registry: heartbeat acknowledgement.
    HeartbeatAck = 303,
    /// Registry: list all live peers.
    ListPeers = 310,
    /// Registry: live peer listing.
    PeerList = 311,
    /// Registry: find live peers advertising a file.
    FindFile = 312,
    /// Registry: provider listing for a file.
    FileProviders = 313,
    /// Error reply, any phase.
    Error = 500,
}

impl From<MsgType> for u16 {
    fn from(value: MsgType) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for MsgType {
    type Error = anyhow::Error;

    fn try_from(value: u16) -> Result<Self, anyhow::Error> {
        match value {
            100 => Ok(Self::Hello),
            101 => Ok(Self::SessionKey),
            200 => Ok(Self::Meta),
            201 => Ok(Self::MetaReply),
            210 => Ok(Self::Get),
            211 => Ok(Self::Chunk),
            300 => Ok(Self::Register),
            301 => Ok(Self::Registered),
            302 => Ok(Self::Heartbeat),
            303 => Ok(Self::HeartbeatAck),
            310 => Ok(Self::ListPeers),
            311 => Ok(Self::PeerList),
            312 => Ok(Self::FindFile),
            313 => Ok(Self::FileProviders),
            500 => Ok(MsgType::Error),
            _ => anyhow::bail!("unknown message type {value}"),
        }
    }
}

// ── Error codes carried in `ErrorReply` ─────────────────────────────────

pub const ERR_UNKNOWN_FILE: u16 = 1;
pub const ERR_CHUNK_OUT_OF_RANGE: u16 = 2;
pub const ERR_BAD_REQUEST: u16 = 3;
pub const ERR_HANDSHAKE: u16 = 4;
pub const ERR_INTERNAL: u16 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub peer_id: PeerId,
    #[serde(with = "serde_bytes")]
    pub public_key_der: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionKey {
    #[serde(with = "serde_bytes")]
    pub encrypted_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meta {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaReply {
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub file_digest: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Get {
    pub filename: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkData {
    pub filename: String,
    pub index: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Register {
    pub peer_id: PeerId,
    pub port: u16,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registered {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub peer_id: PeerId,
    pub port: u16,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// `false` when the registry had never seen this peer and performed
    /// an implicit registration instead of a refresh.
    pub refreshed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListPeers {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    pub file_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerList {
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindFile {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileProviders {
    pub filename: String,
    pub found_count: u32,
    pub peers: Vec<PeerEndpoint>,
}

/// Closed set of protocol messages. Decoding an envelope yields one of
/// these variants; handlers match them exhaustively, so a new message
/// type is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    Hello(Hello),
    SessionKey(SessionKey),
    Meta(Meta),
    MetaReply(MetaReply),
    Get(Get),
    Chunk(ChunkData),
    Register(Register),
    Registered(Registered),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    ListPeers(ListPeers),
    PeerList(PeerList),
    FindFile(FindFile),
    FileProviders(FileProviders),
    Error(ErrorReply),
}

impl WirePayload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Hello(_) => MsgType::Hello,
            Self::SessionKey(_) => MsgType::SessionKey,
            Self::Meta(_) => MsgType::Meta,
            Self::MetaReply(_) => MsgType::MetaReply,
            Self::Get(_) => MsgType::Get,
            Self::Chunk(_) => MsgType::Chunk,
            Self::Register(_) => MsgType::Register,
            Self::Registered(_) => MsgType::Registered,
            Self::Heartbeat(_) => MsgType::Heartbeat,
            Self::HeartbeatAck(_) => MsgType::HeartbeatAck,
            Self::ListPeers(_) => MsgType::ListPeers,
            Self::PeerList(_) => MsgType::PeerList,
            Self::FindFile(_) => MsgType::FindFile,
            Self::FileProviders(_) => MsgType::FileProviders,
            Self::Error(_) => MsgType::Error,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::Hello(msg) => to_cbor(msg),
            Self::SessionKey(msg) => to_cbor(msg),
            Self::Meta(msg) => to_cbor(msg),
            Self::MetaReply(msg) => to_cbor(msg),
            Self::Get(msg) => to_cbor(msg),
            Self::Chunk(msg) => to_cbor(msg),
            Self::Register(msg) => to_cbor(msg),
            Self::Registered(msg) => to_cbor(msg),
            Self::Heartbeat(msg) => to_cbor(msg),
            Self::HeartbeatAck(msg) => to_cbor(msg),
            Self::ListPeers(msg) => to_cbor(msg),
            Self::PeerList(msg) => to_cbor(msg),
            Self::FindFile(msg) => to_cbor(msg),
            Self::FileProviders(msg) => to_cbor(msg),
            Self::Error(msg) => to_cbor(msg),
        }
    }

    pub fn decode(msg_type: u16, payload: &[u8]) -> anyhow::Result<Self> {
        Ok(match MsgType::try_from(msg_type)? {
            MsgType::Hello => Self::Hello(from_cbor(payload)?),
            MsgType::SessionKey => Self::SessionKey(from_cbor(payload)?),
            MsgType::Meta => Self::Meta(from_cbor(payload)?),
            MsgType::MetaReply => Self::MetaReply(from_cbor(payload)?),
            MsgType::Get => Self::Get(from_cbor(payload)?),
            MsgType::Chunk => Self::Chunk(from_cbor(payload)?),
            MsgType::Register => Self::Register(from_cbor(payload)?),
            MsgType::Registered => Self::Registered(from_cbor(payload)?),
            MsgType::Heartbeat => Self::Heartbeat(from_cbor(payload)?),
            MsgType::HeartbeatAck => Self::HeartbeatAck(from_cbor(payload)?),
            MsgType::ListPeers => Self::ListPeers(from_cbor(payload)?),
            MsgType::PeerList => Self::PeerList(from_cbor(payload)?),
            MsgType::FindFile => Self::FindFile(from_cbor(payload)?),
            MsgType::FileProviders => Self::FileProviders(from_cbor(payload)?),
            MsgType::Error => Self::Error(from_cbor(payload)?),
        })
    }

    /// Shorthand for an error reply payload.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error(ErrorReply {
            code,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_envelope_roundtrip() {
        let payload = WirePayload::Get(Get {
            filename: "report.pdf".into(),
            index: 3,
        });
        let env = Envelope::from_typed(42, 0, &payload).expect("build envelope");
        let bytes = env.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");

        assert_eq!(decoded.req_id, 42);
        assert_eq!(decoded.r#type, MsgType::Get as u16);
        assert_eq!(decoded.decode_typed().expect("typed"), payload);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let env = Envelope {
            r#type: 12345,
            req_id: 1,
            flags: 0,
            payload: vec![],
        };
        let err = env.decode_typed().expect_err("must reject");
        assert!(err.to_string().contains("unknown message type"));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let env = Envelope {
            r#type: MsgType::Chunk as u16,
            req_id: 1,
            flags: 0,
            payload: vec![0u8; MAX_ENVELOPE_PAYLOAD_BYTES + 1],
        };
        let bytes = env.encode().expect("encode");
        let err = Envelope::decode(&bytes).expect_err("must reject oversized payload");
        assert!(err.to_string().contains("payload exceeds max size"));
    }

    #[test]
    fn chunk_payload_carries_raw_bytes() {
        let chunk = WirePayload::Chunk(ChunkData {
            filename: "a.bin".into(),
            index: 0,
            data: vec![9u8; 1024],
        });
        let env = Envelope::from_typed(7, FLAG_RESPONSE, &chunk).expect("envelope");
        let WirePayload::Chunk(decoded) = env.decode_typed().expect("typed") else {
            panic!("wrong variant");
        };
        assert_eq!(decoded.data.len(), 1024);
    }
}
