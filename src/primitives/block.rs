// Data Structures: Block
use serde::{Deserialize, Serialize};

use super::decode_hash;
use super::transaction::Transaction;
use crate::crypto::hash::{merkle_root, sha256};
use crate::crypto::velora::VeloraInput;

/// Previous-hash literal carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";
/// The only proof-of-work algorithm tag this chain accepts.
pub const ALGORITHM_VELORA: &str = "velora";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Height, monotonic from 0.
    pub index: u64,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub nonce: u64,
    pub difficulty: u64,
    pub transactions: Vec<Transaction>,
    /// Velora hash of the header, hex.
    pub hash: String,
    pub algorithm: String,
}

impl Block {
    /// Header digest: the nonce-independent part of the Velora seed buffer.
    pub fn header_hash(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(8 + 8 + 32 + 32);
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&decode_hash(&self.previous_hash));
        buf.extend_from_slice(&decode_hash(&self.merkle_root));
        sha256(&buf)
    }

    /// Velora input for this header at a given nonce.
    pub fn pow_input(&self, nonce: u64) -> VeloraInput {
        VeloraInput {
            height: self.index,
            header_hash: self.header_hash(),
            nonce,
            timestamp: self.timestamp,
            previous_hash: decode_hash(&self.previous_hash),
            merkle_root: decode_hash(&self.merkle_root),
            difficulty: self.difficulty,
        }
    }

    /// Merkle root over the transaction ids, hex.
    pub fn compute_merkle_root(transactions: &[Transaction]) -> String {
        let leaves: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.id_bytes()).collect();
        hex::encode(merkle_root(&leaves))
    }

    /// Sum of fees carried by the non-coinbase transactions.
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase)
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase)
    }

    /// Wire size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
