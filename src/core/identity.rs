// src/core/identity.rs

//! Long-lived node identity. A node is its Ed25519 keypair; the node id is
//! the hex encoding of the public key and survives restarts.

use crate::core::{MeshError, NodeId, fsutil};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::Path;
use tracing::info;

const KEY_FILE: &str = "node.key";
const PUB_FILE: &str = "node.pub";

/// The node's keypair plus its derived id.
pub struct NodeIdentity {
    signing: SigningKey,
    id: NodeId,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity").field("id", &self.id).finish()
    }
}

impl NodeIdentity {
    /// Loads the identity from `<data_dir>/node.key`, generating and
    /// persisting a fresh keypair on first start. A key file that exists but
    /// cannot be parsed is a fatal error: continuing would let the node
    /// rejoin the cluster under a different identity.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, MeshError> {
        let key_path = data_dir.join(KEY_FILE);
        match std::fs::read(&key_path) {
            Ok(bytes) => {
                let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    MeshError::Fatal(format!(
                        "identity key at {} has invalid length {}",
                        key_path.display(),
                        bytes.len()
                    ))
                })?;
                let signing = SigningKey::from_bytes(&raw);
                Ok(Self::from_signing_key(signing))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let signing = SigningKey::generate(&mut rand::rngs::OsRng);
                fsutil::write_atomic_sync(&key_path, &signing.to_bytes())?;
                fsutil::write_atomic_sync(
                    &data_dir.join(PUB_FILE),
                    hex::encode(signing.verifying_key().to_bytes()).as_bytes(),
                )?;
                let identity = Self::from_signing_key(signing);
                info!("Generated new node identity {}", identity.id);
                Ok(identity)
            }
            Err(e) => Err(MeshError::Fatal(format!(
                "cannot read identity key at {}: {e}",
                key_path.display()
            ))),
        }
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let id = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, id }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Signs arbitrary bytes with the node key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verifies that `signature` over `message` was produced by the key behind
/// `node_id` (a hex-encoded Ed25519 public key).
pub fn verify_node_signature(
    node_id: &NodeId,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), MeshError> {
    let raw = hex::decode(node_id)
        .map_err(|_| MeshError::AuthFailed(format!("malformed node id '{node_id}'")))?;
    let raw: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| MeshError::AuthFailed(format!("node id '{node_id}' is not a public key")))?;
    let key = VerifyingKey::from_bytes(&raw)
        .map_err(|_| MeshError::AuthFailed(format!("node id '{node_id}' is not a valid key")))?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| MeshError::AuthFailed(format!("signature check failed for {node_id}")))
}
