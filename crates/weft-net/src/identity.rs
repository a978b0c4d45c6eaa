//! Durable node identity.
//!
//! A node's identity is an ed25519 keypair persisted as a small JSON document:
//!
//! ```json
//! {"publicKey":"<base64>","privateKey":"<base64>"}
//! ```
//!
//! The private key is the 32-byte ed25519 seed and the public key the 32-byte
//! verifying key, both base64 (standard alphabet). The libp2p `PeerId` (the
//! node's externally visible id) is derived from the public key alone.
//!
//! A present-but-corrupt file is a hard error. The identity is never
//! regenerated behind the operator's back, because that would change the
//! node's address for every peer that already knows it.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose};
use ed25519_dalek::SigningKey;
use libp2p::PeerId;
use libp2p::identity::{self, Keypair};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;
use weft_types::NodeId;

use crate::error::NetError;

/// On-disk representation of the identity.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    public_key: String,
    private_key: String,
}

/// A node's cryptographic identity.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    keypair: Keypair,
    node_id: NodeId,
    peer_id: PeerId,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl NodeIdentity {
    /// Load the identity at `path`, generating and persisting a new one if
    /// the file does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, NetError> {
        let path = path.as_ref();

        match std::fs::read(path) {
            Ok(raw) => {
                let identity = Self::decode(&raw).map_err(|reason| NetError::Identity {
                    path: path.to_path_buf(),
                    reason,
                })?;
                info!(
                    path = %path.display(),
                    peer_id = %identity.peer_id,
                    "loaded existing node identity"
                );
                Ok(identity)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate()?;
                identity.persist(path)?;
                info!(
                    path = %path.display(),
                    peer_id = %identity.peer_id,
                    "generated new node identity"
                );
                Ok(identity)
            }
            Err(e) => Err(NetError::Identity {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// Generate a fresh identity from OS entropy.
    pub fn generate() -> Result<Self, NetError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| NetError::KeyGen(e.to_string()))?;
        Self::from_secret(seed)
    }

    /// Build an identity from a 32-byte ed25519 seed.
    pub fn from_secret(seed: [u8; 32]) -> Result<Self, NetError> {
        let signing_key = SigningKey::from_bytes(&seed);
        let keypair = Keypair::ed25519_from_bytes(seed)
            .map_err(|e| NetError::KeyGen(e.to_string()))?;
        let node_id = NodeId::from(signing_key.verifying_key().to_bytes());
        let peer_id = keypair.public().to_peer_id();
        Ok(Self {
            signing_key,
            keypair,
            node_id,
            peer_id,
        })
    }

    /// Raw public key as a [`NodeId`].
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// libp2p peer id derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The derived id in its printable (base58) form.
    pub fn derived_id(&self) -> String {
        self.peer_id.to_base58()
    }

    /// Signing key for log entries and DHT records.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// libp2p keypair for the swarm.
    pub fn keypair(&self) -> Keypair {
        self.keypair.clone()
    }

    fn decode(raw: &[u8]) -> Result<Self, String> {
        let file: IdentityFile = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
        let private = decode_key(&file.private_key, "privateKey")?;
        let public = decode_key(&file.public_key, "publicKey")?;

        let identity = Self::from_secret(private).map_err(|e| e.to_string())?;
        if identity.node_id.as_bytes() != &public {
            return Err("publicKey does not match privateKey".to_string());
        }
        Ok(identity)
    }

    /// Atomically write the identity file (tmp + fsync + rename).
    fn persist(&self, path: &Path) -> Result<(), NetError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = IdentityFile {
            public_key: general_purpose::STANDARD.encode(self.node_id.as_bytes()),
            private_key: general_purpose::STANDARD.encode(self.signing_key.to_bytes()),
        };
        let json = serde_json::to_vec(&file).map_err(|e| NetError::Serialization(e.to_string()))?;

        let tmp_path = tmp_sibling(path);
        {
            let mut out = std::fs::File::create(&tmp_path)?;
            restrict_permissions(&out)?;
            out.write_all(&json)?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Convert a [`NodeId`] (raw ed25519 public key) into a libp2p [`PeerId`].
///
/// Returns `None` if the bytes are not a valid ed25519 point.
pub fn peer_id_of(node_id: &NodeId) -> Option<PeerId> {
    let key = identity::ed25519::PublicKey::try_from_bytes(node_id.as_bytes()).ok()?;
    Some(identity::PublicKey::from(key).to_peer_id())
}

/// The ed25519 public key inlined in `peer`, if it carries one.
pub fn node_id_of(peer: &PeerId) -> Option<NodeId> {
    let multihash: &libp2p::multihash::Multihash<64> = peer.as_ref();
    // Ed25519 peer ids use the identity hash, so the digest is the key itself.
    if multihash.code() != 0x00 {
        return None;
    }
    let key = identity::PublicKey::try_decode_protobuf(multihash.digest()).ok()?;
    let key = key.try_into_ed25519().ok()?;
    Some(NodeId::from(key.to_bytes()))
}

fn decode_key(value: &str, field: &str) -> Result<[u8; 32], String> {
    let bytes = general_purpose::STANDARD
        .decode(value)
        .map_err(|e| format!("{field}: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("{field}: expected 32 bytes, got {}", b.len()))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{:016x}.tmp", OsRng.next_u64()));
    path.with_file_name(name)
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
