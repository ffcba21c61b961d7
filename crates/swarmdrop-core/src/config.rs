use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::manifest::CHUNK_SIZE;
use crate::registry::HEARTBEAT_INTERVAL_SECS;
use crate::transfer::TransferPolicy;

/// Runtime configuration for a peer node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address the peer server binds; port 0 picks a free port.
    pub bind: SocketAddr,
    /// Discovery registry address. `None` disables discovery; direct
    /// downloads by address still work.
    pub registry_addr: Option<SocketAddr>,
    /// Directory of files offered to other peers.
    pub shared_dir: PathBuf,
    /// Directory completed downloads land in.
    pub downloads_dir: PathBuf,
    /// Directory holding the RSA keypair.
    pub key_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub chunk_size: u32,
    pub transfer: TransferPolicy,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".parse().expect("static addr"),
            registry_addr: None,
            shared_dir: PathBuf::from("shared"),
            downloads_dir: PathBuf::from("downloads"),
            key_dir: PathBuf::from("keys"),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            chunk_size: CHUNK_SIZE,
            transfer: TransferPolicy::default(),
        }
    }
}
