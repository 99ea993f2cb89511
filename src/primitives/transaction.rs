// Data Structures: Transaction
//
// Ids and signatures are computed over a canonical length-prefixed binary
// encoding, never over JSON: integers little-endian, strings u32-length
// prefixed, sequences u32-count prefixed. The signing preimage blanks every
// input signature (public keys stay); the id covers the full encoding
// including signatures, so a re-signed transaction gets a new id.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::crypto::keys::KeyPair;

/// Default spend-transaction lifetime before `expires_at` (24 hours).
pub const DEFAULT_TX_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxTag {
    Coinbase,
    Premine,
    Transaction,
    Staking,
    Governance,
}

impl TxTag {
    fn canonical_byte(self) -> u8 {
        match self {
            TxTag::Coinbase => 0,
            TxTag::Premine => 1,
            TxTag::Transaction => 2,
            TxTag::Staking => 3,
            TxTag::Governance => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInput {
    /// Hex id of the transaction holding the referenced output.
    pub tx_id: String,
    pub output_index: u32,
    /// Hex DER-encoded ECDSA signature over the signing preimage.
    pub signature: String,
    /// Hex SEC1 public key (compressed or uncompressed).
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub address: String,
    /// Atomic units; always positive in a valid transaction.
    pub amount: u64,
    pub tag: TxTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub fee: u64,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    /// Replay-protection nonce, unique per (nonce, sender key) window.
    pub nonce: String,
    pub expires_at: u64,
    pub sequence: u64,
    pub is_coinbase: bool,
    pub tag: TxTag,
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

impl Transaction {
    /// Canonical consensus encoding. `include_signatures` selects between the
    /// id form (true) and the signing preimage (false).
    fn canonical_bytes(&self, include_signatures: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        put_u32(&mut buf, self.inputs.len() as u32);
        for input in &self.inputs {
            put_str(&mut buf, &input.tx_id);
            put_u32(&mut buf, input.output_index);
            if include_signatures {
                put_str(&mut buf, &input.signature);
            } else {
                put_str(&mut buf, "");
            }
            put_str(&mut buf, &input.public_key);
        }

        put_u32(&mut buf, self.outputs.len() as u32);
        for output in &self.outputs {
            put_str(&mut buf, &output.address);
            put_u64(&mut buf, output.amount);
            buf.push(output.tag.canonical_byte());
        }

        put_u64(&mut buf, self.fee);
        put_u64(&mut buf, self.timestamp);
        put_str(&mut buf, &self.nonce);
        put_u64(&mut buf, self.expires_at);
        put_u64(&mut buf, self.sequence);
        buf.push(self.is_coinbase as u8);
        buf.push(self.tag.canonical_byte());
        buf
    }

    /// Digest every input signs.
    pub fn signing_hash(&self) -> [u8; 32] {
        sha256(&self.canonical_bytes(false))
    }

    /// Definitive transaction id (includes signatures, preventing a mutated
    /// signature from aliasing the original id).
    pub fn compute_id(&self) -> String {
        hex::encode(sha256(&self.canonical_bytes(true)))
    }

    /// Raw 32-byte id, as fed to the Merkle tree.
    pub fn id_bytes(&self) -> [u8; 32] {
        super::decode_hash(&self.id)
    }

    pub fn seal(&mut self) {
        self.id = self.compute_id();
    }

    /// Sign every input with one key and recompute the id.
    pub fn sign_inputs(&mut self, keypair: &KeyPair) {
        let digest = self.signing_hash();
        let signature = hex::encode(keypair.sign(&digest));
        let public_key = keypair.public_hex();
        for input in &mut self.inputs {
            input.signature = signature.clone();
            input.public_key = public_key.clone();
        }
        self.seal();
    }

    /// Build the coinbase for a block: no inputs, exactly one output paying
    /// subsidy plus fees.
    pub fn coinbase(
        address: &str,
        amount: u64,
        timestamp: u64,
        nonce: String,
        sequence: u64,
        tag: TxTag,
    ) -> Self {
        let mut tx = Transaction {
            id: String::new(),
            inputs: Vec::new(),
            outputs: vec![TransactionOutput {
                address: address.to_string(),
                amount,
                tag,
            }],
            fee: 0,
            timestamp,
            nonce,
            expires_at: timestamp + DEFAULT_TX_TTL_MS,
            sequence,
            is_coinbase: true,
            tag,
        };
        tx.seal();
        tx
    }

    /// Sum of outputs, None on overflow.
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Wire size in bytes; the mempool prices admission in fee per byte.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Replay-registry key: the nonce paired with the first signer.
    pub fn replay_key(&self) -> Option<(String, String)> {
        self.inputs
            .first()
            .map(|i| (self.nonce.clone(), i.public_key.clone()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fully signed single-input spend used across the consensus tests.
    pub fn signed_spend(
        keypair: &KeyPair,
        prev_tx_id: &str,
        output_index: u32,
        to: &str,
        amount: u64,
        fee: u64,
        timestamp: u64,
        nonce: &str,
    ) -> Transaction {
        let mut tx = Transaction {
            id: String::new(),
            inputs: vec![TransactionInput {
                tx_id: prev_tx_id.to_string(),
                output_index,
                signature: String::new(),
                public_key: String::new(),
            }],
            outputs: vec![TransactionOutput {
                address: to.to_string(),
                amount,
                tag: TxTag::Transaction,
            }],
            fee,
            timestamp,
            nonce: nonce.to_string(),
            expires_at: timestamp + DEFAULT_TX_TTL_MS,
            sequence: 0,
            is_coinbase: false,
            tag: TxTag::Transaction,
        };
        tx.sign_inputs(keypair);
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned_sample() -> Transaction {
        Transaction {
            id: String::new(),
            inputs: vec![TransactionInput {
                tx_id: "ab".repeat(32),
                output_index: 0,
                signature: String::new(),
                public_key: String::new(),
            }],
            outputs: vec![TransactionOutput {
                address: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string(),
                amount: 5_000,
                tag: TxTag::Transaction,
            }],
            fee: 10,
            timestamp: 1_700_000_000_000,
            nonce: "n-1".to_string(),
            expires_at: 1_700_000_000_000 + DEFAULT_TX_TTL_MS,
            sequence: 0,
            is_coinbase: false,
            tag: TxTag::Transaction,
        }
    }

    #[test]
    fn test_id_stable_across_construction_paths() {
        let a = unsigned_sample();
        let b = unsigned_sample();
        assert_eq!(a.compute_id(), b.compute_id());
    }

    #[test]
    fn test_id_covers_signature() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_sample();
        let unsigned_id = tx.compute_id();
        tx.sign_inputs(&kp);
        assert_ne!(tx.id, unsigned_id);
    }

    #[test]
    fn test_signing_hash_ignores_signature() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_sample();
        let before = tx.signing_hash();
        tx.sign_inputs(&kp);
        // The preimage blanks signatures but keeps the public key, which
        // signing fills in — so the digest changes with the key, not the sig.
        let mut resigned = tx.clone();
        resigned.inputs[0].signature = "00".repeat(70);
        assert_eq!(tx.signing_hash(), resigned.signing_hash());
        assert_ne!(before, tx.signing_hash());
    }

    #[test]
    fn test_signature_verifies_over_preimage() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_sample();
        tx.sign_inputs(&kp);

        let digest = tx.signing_hash();
        let sig = hex::decode(&tx.inputs[0].signature).unwrap();
        let pk = hex::decode(&tx.inputs[0].public_key).unwrap();
        assert!(crate::crypto::keys::verify_signature(&pk, &digest, &sig));
    }

    #[test]
    fn test_coinbase_shape() {
        let cb = Transaction::coinbase(
            "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2",
            50_0000_0000,
            1_700_000_000_000,
            "cb-0".to_string(),
            0,
            TxTag::Coinbase,
        );
        assert!(cb.is_coinbase);
        assert!(cb.inputs.is_empty());
        assert_eq!(cb.outputs.len(), 1);
        assert_eq!(cb.id, cb.compute_id());
    }

    #[test]
    fn test_json_roundtrip_preserves_id() {
        let kp = KeyPair::generate();
        let mut tx = unsigned_sample();
        tx.sign_inputs(&kp);

        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.compute_id(), tx.id);
    }

    #[test]
    fn test_tag_wire_names_uppercase() {
        let json = serde_json::to_string(&TxTag::Coinbase).unwrap();
        assert_eq!(json, "\"COINBASE\"");
        let tag: TxTag = serde_json::from_str("\"GOVERNANCE\"").unwrap();
        assert_eq!(tag, TxTag::Governance);
    }

    #[test]
    fn test_total_output_overflow() {
        let mut tx = unsigned_sample();
        tx.outputs.push(TransactionOutput {
            address: tx.outputs[0].address.clone(),
            amount: u64::MAX,
            tag: TxTag::Transaction,
        });
        assert!(tx.total_output().is_none());
    }
}
