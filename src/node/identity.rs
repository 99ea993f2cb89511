// Persistent node identity.
//
// Each node carries a random 32-byte node_id plus an ECDSA keypair, created
// on first start and persisted with owner-only permissions. The keypair
// answers AUTH_CHALLENGE frames; the node_id travels in every handshake.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::crypto::keys::KeyPair;

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    node_id: String,
    private_key: String,
    public_key: String,
    created_at: u64,
}

#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub keypair: KeyPair,
    pub created_at: u64,
}

impl NodeIdentity {
    /// Load the identity file, or generate and persist a fresh one.
    pub fn load_or_generate(path: &Path, now_ms: u64) -> std::io::Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let file: IdentityFile = serde_json::from_str(&raw).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("corrupt identity file: {e}"),
                )
            })?;
            let keypair = KeyPair::from_secret_hex(&file.private_key).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("corrupt identity key: {e}"),
                )
            })?;
            return Ok(NodeIdentity {
                node_id: file.node_id,
                keypair,
                created_at: file.created_at,
            });
        }

        let mut id_bytes = [0u8; 32];
        getrandom::getrandom(&mut id_bytes)
            .map_err(|e| std::io::Error::other(format!("rng failure: {e}")))?;
        let identity = NodeIdentity {
            node_id: hex::encode(id_bytes),
            keypair: KeyPair::generate(),
            created_at: now_ms,
        };
        identity.save(path)?;
        Ok(identity)
    }

    fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            node_id: self.node_id.clone(),
            private_key: self.keypair.secret_hex(),
            public_key: self.keypair.public_hex(),
            created_at: self.created_at,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Sign a hex challenge with the identity key; the digest is SHA-256 of
    /// the raw challenge bytes.
    pub fn sign_challenge(&self, challenge_hex: &str) -> String {
        let bytes = hex::decode(challenge_hex).unwrap_or_default();
        hex::encode(self.keypair.sign(&sha256(&bytes)))
    }
}
