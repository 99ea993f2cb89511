// Transaction Mempool
//
// In-memory pool of unconfirmed transactions, ordered by fee priority.
// Admission validates against the chain UTXO set merged with the pool's own
// consumed and created outputs, so chained unconfirmed spends are accepted
// but conflicting ones are not. The pool is bounded by total wire bytes;
// eviction drops the lowest fee-per-byte entry, oldest first on ties.

use std::collections::HashMap;

use crate::consensus::utxo::{OutPoint, UtxoView};
use crate::consensus::validate::{NonceRegistry, TxError, validate_transaction};
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub size_bytes: usize,
    /// fee * 10000 / size — deterministic integer priority.
    pub fee_per_byte_scaled: u64,
    /// Monotonic admission order, used as the eviction tiebreak.
    pub arrival: u64,
}

pub struct Mempool {
    max_bytes: usize,
    min_fee: u64,
    entries: HashMap<String, MempoolEntry>,
    /// outpoint -> consuming tx id, for conflict detection.
    consumed: HashMap<OutPoint, String>,
    total_bytes: usize,
    arrivals: u64,
}

/// Chain UTXOs with the pool's pending effects applied: outputs consumed by
/// a pooled transaction disappear, outputs created by one become spendable.
struct PoolView<'a> {
    chain: &'a dyn UtxoView,
    pool: &'a Mempool,
}

impl UtxoView for PoolView<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<crate::consensus::utxo::Utxo> {
        if self.pool.consumed.contains_key(outpoint) {
            return None;
        }
        if let Some(entry) = self.pool.entries.get(&outpoint.tx_id)
            && let Some(output) = entry.tx.outputs.get(outpoint.output_index as usize)
        {
            return Some(crate::consensus::utxo::Utxo {
                address: output.address.clone(),
                amount: output.amount,
                height_created: u64::MAX, // unconfirmed
            });
        }
        self.chain.utxo(outpoint)
    }
}

impl Mempool {
    pub fn new(max_size_kb: usize, min_fee: u64) -> Self {
        Mempool {
            max_bytes: max_size_kb.saturating_mul(1024),
            min_fee,
            entries: HashMap::new(),
            consumed: HashMap::new(),
            total_bytes: 0,
            arrivals: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.entries.get(id).map(|e| &e.tx)
    }

    pub fn all(&self) -> Vec<Transaction> {
        self.entries.values().map(|e| e.tx.clone()).collect()
    }

    /// Validate and admit a transaction.
    pub fn submit(
        &mut self,
        tx: Transaction,
        chain_utxos: &dyn UtxoView,
        replay: &NonceRegistry,
        now_ms: u64,
    ) -> Result<(), TxError> {
        if self.entries.contains_key(&tx.id) {
            return Err(TxError::InvalidStructure("duplicate transaction id"));
        }
        for input in &tx.inputs {
            let outpoint = OutPoint::new(&input.tx_id, input.output_index);
            if self.consumed.contains_key(&outpoint) {
                return Err(TxError::DoubleSpend);
            }
        }

        {
            let view = PoolView {
                chain: chain_utxos,
                pool: self,
            };
            validate_transaction(&tx, &view, now_ms, self.min_fee, Some(replay))?;
        }

        let size = tx.size_bytes().max(1);
        let fee_per_byte_scaled = tx.fee.saturating_mul(10_000) / size as u64;

        // Never evict better-paying traffic to admit worse.
        while self.total_bytes + size > self.max_bytes {
            match self.worst_entry_id() {
                Some(worst) if self.entries[&worst].fee_per_byte_scaled < fee_per_byte_scaled => {
                    self.remove(&worst);
                }
                _ => return Err(TxError::FeeTooLow),
            }
        }

        self.arrivals += 1;
        for input in &tx.inputs {
            self.consumed
                .insert(OutPoint::new(&input.tx_id, input.output_index), tx.id.clone());
        }
        self.total_bytes += size;
        self.entries.insert(
            tx.id.clone(),
            MempoolEntry {
                tx,
                size_bytes: size,
                fee_per_byte_scaled,
                arrival: self.arrivals,
            },
        );
        Ok(())
    }

    fn worst_entry_id(&self) -> Option<String> {
        self.entries
            .values()
            .min_by(|a, b| {
                a.fee_per_byte_scaled
                    .cmp(&b.fee_per_byte_scaled)
                    .then(a.arrival.cmp(&b.arrival))
            })
            .map(|e| e.tx.id.clone())
    }

    fn remove(&mut self, id: &str) -> Option<Transaction> {
        let entry = self.entries.remove(id)?;
        self.total_bytes -= entry.size_bytes;
        for input in &entry.tx.inputs {
            let outpoint = OutPoint::new(&input.tx_id, input.output_index);
            if self.consumed.get(&outpoint).map(String::as_str) == Some(id) {
                self.consumed.remove(&outpoint);
            }
        }
        Some(entry.tx)
    }

    /// Greedy fee-priority selection, dependency-aware: a transaction whose
    /// parent is still pending is deferred until the parent is selected.
    pub fn select_for_block(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| {
            b.fee_per_byte_scaled
                .cmp(&a.fee_per_byte_scaled)
                .then(a.arrival.cmp(&b.arrival))
                .then(a.tx.id.cmp(&b.tx.id))
        });

        let mut selected: Vec<Transaction> = Vec::new();
        let mut selected_ids = std::collections::HashSet::new();
        let mut bytes = 0usize;

        // Multiple passes resolve parent-before-child ordering; each pass
        // admits at least one transaction or the loop ends.
        loop {
            let mut progressed = false;
            for entry in &candidates {
                if selected.len() >= max_count || bytes + entry.size_bytes > max_bytes {
                    continue;
                }
                if selected_ids.contains(&entry.tx.id) {
                    continue;
                }
                let deps_met = entry.tx.inputs.iter().all(|input| {
                    !self.entries.contains_key(&input.tx_id)
                        || selected_ids.contains(&input.tx_id)
                });
                if !deps_met {
                    continue;
                }
                selected_ids.insert(entry.tx.id.clone());
                bytes += entry.size_bytes;
                selected.push(entry.tx.clone());
                progressed = true;
            }
            if !progressed || selected.len() >= max_count {
                break;
            }
        }
        selected
    }

    /// Remove transactions included in a block, plus anything that now
    /// conflicts with the block's spends.
    pub fn remove_confirmed(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.remove(&tx.id);
        }
        let conflicting: Vec<String> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.inputs.iter())
            .filter_map(|input| {
                self.consumed
                    .get(&OutPoint::new(&input.tx_id, input.output_index))
                    .cloned()
            })
            .collect();
        for id in conflicting {
            self.remove(&id);
        }
    }

    /// Drop expired transactions. Returns how many were removed.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.tx.expires_at <= now_ms)
            .map(|e| e.tx.id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.remove(&id);
        }
        count
    }

    /// Clear and return everything — used when a reorg replaces the chain
    /// and the pool must be rebuilt against the new UTXO state.
    pub fn drain(&mut self) -> Vec<Transaction> {
        let txs = self.all();
        self.entries.clear();
        self.consumed.clear();
        self.total_bytes = 0;
        txs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::utxo::UtxoSet;
    use crate::crypto::keys::KeyPair;
    use crate::primitives::transaction::{TxTag, test_support::signed_spend};

    const NOW: u64 = 1_700_000_000_000;

    fn funded(kp: &KeyPair, outputs: u64, amount: u64) -> (UtxoSet, Vec<Transaction>) {
        let mut set = UtxoSet::new();
        let mut coinbases = Vec::new();
        for i in 0..outputs {
            let cb = Transaction::coinbase(
                &kp.address(),
                amount,
                NOW,
                format!("cb-{i}"),
                i,
                TxTag::Coinbase,
            );
            set.apply_transaction(&cb, 0);
            coinbases.push(cb);
        }
        (set, coinbases)
    }

    fn pool() -> Mempool {
        Mempool::new(1024, 1)
    }

    #[test]
    fn test_submit_and_select() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 1, 10_000);
        let mut pool = pool();

        let tx = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 100, NOW, "n1");
        pool.submit(tx.clone(), &set, &NonceRegistry::new(), NOW).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&tx.id));

        let picked = pool.select_for_block(100, 1 << 20);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, tx.id);
    }

    #[test]
    fn test_double_spend_second_rejected() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 1, 10_000);
        let mut pool = pool();

        let t1 = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 100, NOW, "n1");
        let t2 = signed_spend(&kp, &cbs[0].id, 0, &kp.address(), 9_000, 200, NOW, "n2");

        pool.submit(t1, &set, &NonceRegistry::new(), NOW).unwrap();
        assert_eq!(
            pool.submit(t2, &set, &NonceRegistry::new(), NOW),
            Err(TxError::DoubleSpend)
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 1, 10_000);
        let mut pool = pool();

        let tx = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 100, NOW, "n1");
        pool.submit(tx.clone(), &set, &NonceRegistry::new(), NOW).unwrap();
        assert!(matches!(
            pool.submit(tx, &set, &NonceRegistry::new(), NOW),
            Err(TxError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_chained_unconfirmed_spend() {
        let kp = KeyPair::generate();
        let (set, cbs) = funded(&kp, 1, 10_000);
        let mut pool = pool();

        // Parent pays back to the same key, child spends the parent output.
        let parent = signed_spend(&kp, &cbs[0].id, 0, &kp.address(), 9_900, 100, NOW, "n1");
        let child = signed_spend(&kp, &parent.id, 0, &kp.address(), 9_800, 100, NOW, "n2");

        pool.submit(parent.clone(), &set, &NonceRegistry::new(), NOW).unwrap();
        pool.submit(child.clone(), &set, &NonceRegistry::new(), NOW).unwrap();

        // Selection must order the parent first.
        let picked = pool.select_for_block(100, 1 << 20);
        let parent_pos = picked.iter().position(|t| t.id == parent.id).unwrap();
        let child_pos = picked.iter().position(|t| t.id == child.id).unwrap();
        assert!(parent_pos < child_pos);
    }

    #[test]
    fn test_fee_priority_order() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 3, 10_000);
        let mut pool = pool();

        let low = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 50, NOW, "n1");
        let high = signed_spend(&kp, &cbs[1].id, 0, &dest, 9_000, 500, NOW, "n2");
        let mid = signed_spend(&kp, &cbs[2].id, 0, &dest, 9_000, 100, NOW, "n3");

        for tx in [low.clone(), high.clone(), mid.clone()] {
            pool.submit(tx, &set, &NonceRegistry::new(), NOW).unwrap();
        }

        let picked = pool.select_for_block(2, 1 << 20);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].id, high.id);
        assert_eq!(picked[1].id, mid.id);
    }

    #[test]
    fn test_size_cap_evicts_lowest_fee() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 3, 10_000);
        // Tiny pool: fits roughly one transaction.
        let mut pool = Mempool::new(1, 1);

        let cheap = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 10, NOW, "n1");
        pool.submit(cheap.clone(), &set, &NonceRegistry::new(), NOW).unwrap();

        let rich = signed_spend(&kp, &cbs[1].id, 0, &dest, 9_000, 5_000, NOW, "n2");
        pool.submit(rich.clone(), &set, &NonceRegistry::new(), NOW).unwrap();

        assert!(!pool.contains(&cheap.id), "cheap tx must be evicted");
        assert!(pool.contains(&rich.id));

        // A worse-paying tx cannot displace a better one.
        let worse = signed_spend(&kp, &cbs[2].id, 0, &dest, 9_000, 1, NOW, "n3");
        assert_eq!(
            pool.submit(worse, &set, &NonceRegistry::new(), NOW),
            Err(TxError::FeeTooLow)
        );
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 1, 10_000);
        let mut pool = pool();

        let tx = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 100, NOW, "n1");
        let expires = tx.expires_at;
        pool.submit(tx, &set, &NonceRegistry::new(), NOW).unwrap();

        assert_eq!(pool.cleanup(expires - 1), 0);
        assert_eq!(pool.cleanup(expires), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn test_remove_confirmed_drops_conflicts() {
        let kp = KeyPair::generate();
        let dest = KeyPair::generate().address();
        let (set, cbs) = funded(&kp, 1, 10_000);
        let mut pool = pool();

        let pooled = signed_spend(&kp, &cbs[0].id, 0, &dest, 9_000, 100, NOW, "n1");
        pool.submit(pooled.clone(), &set, &NonceRegistry::new(), NOW).unwrap();

        // A block confirms a different spend of the same outpoint.
        let confirmed = signed_spend(&kp, &cbs[0].id, 0, &kp.address(), 9_000, 200, NOW, "n2");
        let block = Block {
            index: 1,
            timestamp: NOW + 60_000,
            previous_hash: "00".repeat(32),
            merkle_root: Block::compute_merkle_root(std::slice::from_ref(&confirmed)),
            nonce: 0,
            difficulty: 1,
            transactions: vec![confirmed],
            hash: "11".repeat(32),
            algorithm: "velora".to_string(),
        };

        pool.remove_confirmed(&block);
        assert!(!pool.contains(&pooled.id), "conflicting tx must be dropped");
        assert!(pool.is_empty());
    }
}
