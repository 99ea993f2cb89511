// UTXO ledger.
//
// The persistent set holds every unspent output of the active chain; spends
// remove entries, inclusions add them. Validation against a candidate block
// runs through BlockOverlay, which stages that block's consumptions and
// creations without touching the underlying set until the block commits.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub tx_id: String,
    pub output_index: u32,
}

impl OutPoint {
    pub fn new(tx_id: &str, output_index: u32) -> Self {
        OutPoint {
            tx_id: tx_id.to_string(),
            output_index,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub address: String,
    pub amount: u64,
    pub height_created: u64,
}

/// Read access to unspent outputs. Implemented by the chain's persistent set
/// and by per-block overlays.
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo>;
}

#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    /// Direct insertion — wallet tooling reconstructing a view from the API.
    pub fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) {
        self.entries.insert(outpoint, utxo);
    }

    /// Spend the inputs and add the outputs of one transaction.
    pub fn apply_transaction(&mut self, tx: &Transaction, height: u64) {
        for input in &tx.inputs {
            self.entries
                .remove(&OutPoint::new(&input.tx_id, input.output_index));
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            self.entries.insert(
                OutPoint::new(&tx.id, index as u32),
                Utxo {
                    address: output.address.clone(),
                    amount: output.amount,
                    height_created: height,
                },
            );
        }
    }

    pub fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.apply_transaction(tx, block.index);
        }
    }

    /// Rebuild the whole set from a block sequence (startup, reorg).
    pub fn rebuild(blocks: &[Block]) -> Self {
        let mut set = UtxoSet::new();
        for block in blocks {
            set.apply_block(block);
        }
        set
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.entries
            .values()
            .filter(|u| u.address == address)
            .fold(0u64, |acc, u| acc.saturating_add(u.amount))
    }

    pub fn outputs_of(&self, address: &str) -> Vec<(OutPoint, Utxo)> {
        let mut out: Vec<(OutPoint, Utxo)> = self
            .entries
            .iter()
            .filter(|(_, u)| u.address == address)
            .map(|(op, u)| (op.clone(), u.clone()))
            .collect();
        out.sort_by(|a, b| a.0.tx_id.cmp(&b.0.tx_id).then(a.0.output_index.cmp(&b.0.output_index)));
        out
    }
}

impl UtxoView for UtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.entries.get(outpoint).cloned()
    }
}

/// Stages one candidate block's effects on top of a base view. Consumptions
/// shadow the base; creations become spendable by later transactions in the
/// same block.
pub struct BlockOverlay<'a> {
    base: &'a dyn UtxoView,
    consumed: HashSet<OutPoint>,
    created: HashMap<OutPoint, Utxo>,
}

impl<'a> BlockOverlay<'a> {
    pub fn new(base: &'a dyn UtxoView) -> Self {
        BlockOverlay {
            base,
            consumed: HashSet::new(),
            created: HashMap::new(),
        }
    }

    /// Mark an outpoint spent. Returns false when it was already consumed in
    /// this overlay (an intra-block double spend).
    pub fn consume(&mut self, outpoint: OutPoint) -> bool {
        self.created.remove(&outpoint);
        self.consumed.insert(outpoint)
    }

    /// Stage the outputs a transaction creates.
    pub fn create_outputs(&mut self, tx: &Transaction, height: u64) {
        for (index, output) in tx.outputs.iter().enumerate() {
            self.created.insert(
                OutPoint::new(&tx.id, index as u32),
                Utxo {
                    address: output.address.clone(),
                    amount: output.amount,
                    height_created: height,
                },
            );
        }
    }
}

impl UtxoView for BlockOverlay<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        if self.consumed.contains(outpoint) {
            return None;
        }
        if let Some(u) = self.created.get(outpoint) {
            return Some(u.clone());
        }
        self.base.utxo(outpoint)
    }
}
