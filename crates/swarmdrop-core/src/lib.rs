pub mod config;
pub mod identity;
pub mod manifest;
pub mod node;
pub mod registry;
pub mod server;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use config::PeerConfig;
pub use identity::{Identity, PeerId};
pub use manifest::{
    build_manifest, chunk_count, expected_chunk_len, read_chunk, validate_no_traversal,
    FileManifest, CHUNK_SIZE,
};
pub use node::{DownloadId, PeerHandle, PeerNode, PeerStatus, SharedFile};
pub use registry::{
    Registry, RegistryClient, RegistryRecord, RegistryServer, DEFAULT_TTL_SECS,
    HEARTBEAT_INTERVAL_SECS,
};
pub use server::PeerServer;
pub use session::{
    handshake_initiator, handshake_responder, HandshakeState, SecureChannel, Session,
    HANDSHAKE_TIMEOUT, NONCE_LEN, SESSION_KEY_LEN,
};
pub use transfer::{
    run_download, DownloadProgress, DownloadStatus, JobHandle, PeerTransport, TcpPeerTransport,
    TransferPolicy,
};
pub use transport::{read_envelope, read_sealed, write_envelope, write_sealed, SealedFrame};
pub use wire::{Envelope, MsgType, WirePayload, FLAG_ERROR, FLAG_RESPONSE};
