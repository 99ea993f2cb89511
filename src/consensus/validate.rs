// Transaction validation contract.
//
// Stateless structure checks first, then UTXO existence, signatures, value
// conservation and replay protection, in that order — the cheapest failure
// wins. Coinbase transactions go through validate_coinbase instead; they
// never enter the mempool.

use std::collections::{HashMap, HashSet};

use crate::crypto::keys::{self, ADDRESS_VERSION_P2PKH, ADDRESS_VERSION_SCRIPT};
use crate::consensus::utxo::{OutPoint, UtxoView};
use crate::primitives::transaction::Transaction;

/// Transaction timestamps may deviate from local time by at most 2 hours.
pub const TIMESTAMP_DRIFT_MS: u64 = 2 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("invalid transaction structure: {0}")]
    InvalidStructure(&'static str),
    #[error("input references unknown output")]
    UnknownInput,
    #[error("input output already spent")]
    DoubleSpend,
    #[error("input signature verification failed")]
    BadSignature,
    #[error("inputs do not cover outputs plus fee")]
    InsufficientFunds,
    #[error("fee below configured minimum")]
    FeeTooLow,
    #[error("transaction expired")]
    Expired,
    #[error("replayed nonce")]
    ReplayedNonce,
    #[error("coinbase rules violated")]
    CoinbaseViolation,
}

impl TxError {
    /// Stable kind string surfaced over HTTP and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TxError::InvalidStructure(_) => "InvalidTransaction",
            TxError::UnknownInput => "UnknownInput",
            TxError::DoubleSpend => "DoubleSpend",
            TxError::BadSignature => "BadSignature",
            TxError::InsufficientFunds => "InsufficientFunds",
            TxError::FeeTooLow => "FeeTooLow",
            TxError::Expired => "Expired",
            TxError::ReplayedNonce => "ReplayedNonce",
            TxError::CoinbaseViolation => "CoinbaseViolation",
        }
    }
}

/// Block subsidy: halved every `halving_interval` blocks, floored at one
/// atomic unit.
pub fn subsidy(height: u64, base_reward: u64, halving_interval: u64) -> u64 {
    let halvings = height / halving_interval.max(1);
    if halvings >= 64 {
        return 1;
    }
    (base_reward >> halvings).max(1)
}

/// Seen (nonce, sender public key) pairs, retained until the transaction
/// that carried them would have expired anyway.
#[derive(Debug, Default)]
pub struct NonceRegistry {
    seen: HashMap<(String, String), u64>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &(String, String)) -> bool {
        self.seen.contains_key(key)
    }

    pub fn record(&mut self, tx: &Transaction) {
        if let Some(key) = tx.replay_key() {
            self.seen.insert(key, tx.expires_at);
        }
    }

    /// Drop entries whose window has passed.
    pub fn cleanup(&mut self, now_ms: u64) {
        self.seen.retain(|_, expires| *expires > now_ms);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn structural_checks(tx: &Transaction, now_ms: u64) -> Result<(), TxError> {
    if tx.outputs.is_empty() {
        return Err(TxError::InvalidStructure("no outputs"));
    }
    for output in &tx.outputs {
        if output.amount == 0 {
            return Err(TxError::InvalidStructure("zero-amount output"));
        }
        if keys::validate_address(&output.address).is_err() {
            return Err(TxError::InvalidStructure("malformed output address"));
        }
    }
    if tx.id != tx.compute_id() {
        return Err(TxError::InvalidStructure("id does not match contents"));
    }
    if tx.expires_at <= tx.timestamp {
        return Err(TxError::InvalidStructure("expiry before creation"));
    }
    if tx.expires_at <= now_ms {
        return Err(TxError::Expired);
    }
    if tx.timestamp > now_ms + TIMESTAMP_DRIFT_MS
        || tx.timestamp + TIMESTAMP_DRIFT_MS < now_ms
    {
        return Err(TxError::InvalidStructure("timestamp outside window"));
    }
    Ok(())
}

/// Full validation of a non-coinbase transaction against a UTXO view.
///
/// `replay` is consulted when present (mempool admission); block-level
/// validation passes the chain's registry.
pub fn validate_transaction(
    tx: &Transaction,
    view: &dyn UtxoView,
    now_ms: u64,
    min_fee: u64,
    replay: Option<&NonceRegistry>,
) -> Result<(), TxError> {
    if tx.is_coinbase {
        return Err(TxError::CoinbaseViolation);
    }
    structural_checks(tx, now_ms)?;

    if tx.inputs.is_empty() {
        return Err(TxError::InvalidStructure("no inputs"));
    }
    if tx.fee < min_fee {
        return Err(TxError::FeeTooLow);
    }

    if let Some(registry) = replay
        && let Some(key) = tx.replay_key()
        && registry.contains(&key)
    {
        return Err(TxError::ReplayedNonce);
    }

    let digest = tx.signing_hash();
    let mut seen_inputs = HashSet::new();
    let mut total_in = 0u64;

    for input in &tx.inputs {
        let outpoint = OutPoint::new(&input.tx_id, input.output_index);
        if !seen_inputs.insert(outpoint.clone()) {
            return Err(TxError::DoubleSpend);
        }

        let Some(utxo) = view.utxo(&outpoint) else {
            return Err(TxError::UnknownInput);
        };

        let Ok(pubkey) = hex::decode(&input.public_key) else {
            return Err(TxError::BadSignature);
        };
        let Ok(signature) = hex::decode(&input.signature) else {
            return Err(TxError::BadSignature);
        };
        if !keys::verify_signature(&pubkey, &digest, &signature) {
            return Err(TxError::BadSignature);
        }
        // The key must actually own the referenced output. The version byte
        // follows the output's address family.
        let version = if utxo.address.starts_with('3') {
            ADDRESS_VERSION_SCRIPT
        } else {
            ADDRESS_VERSION_P2PKH
        };
        match keys::derive_address(&pubkey, version) {
            Ok(addr) if addr == utxo.address => {}
            _ => return Err(TxError::BadSignature),
        }

        total_in = total_in
            .checked_add(utxo.amount)
            .ok_or(TxError::InvalidStructure("input amount overflow"))?;
    }

    let total_out = tx
        .total_output()
        .ok_or(TxError::InvalidStructure("output amount overflow"))?;
    let needed = total_out
        .checked_add(tx.fee)
        .ok_or(TxError::InvalidStructure("output amount overflow"))?;
    if total_in < needed {
        return Err(TxError::InsufficientFunds);
    }

    Ok(())
}

/// Coinbase rules: no inputs, exactly one positive output, amount bounded by
/// subsidy plus the block's fees.
pub fn validate_coinbase(tx: &Transaction, max_amount: u64) -> Result<(), TxError> {
    if !tx.is_coinbase {
        return Err(TxError::CoinbaseViolation);
    }
    if !tx.inputs.is_empty() || tx.outputs.len() != 1 {
        return Err(TxError::CoinbaseViolation);
    }
    let amount = tx.outputs[0].amount;
    if amount == 0 || amount > max_amount {
        return Err(TxError::CoinbaseViolation);
    }
    if tx.id != tx.compute_id() {
        return Err(TxError::InvalidStructure("id does not match contents"));
    }
    Ok(())
}
