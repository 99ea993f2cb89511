// Mining loop: assemble template → resolve epoch scratchpad → iterate nonces.
//
// The CPU-bound search runs on the blocking pool in bounded stints so the
// async side can re-check for a new tip (a block from the network obsoletes
// the current template) and the stop flag between stints. Hashrate is a
// windowed counter over the hashes attempted in the last few seconds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use colored::*;
use tokio::sync::{Mutex, RwLock};

use crate::consensus::chain::{AddOutcome, Blockchain};
use crate::crypto::velora::{self, VeloraEngine};
use crate::net::mempool::Mempool;
use crate::net::node::P2pNode;
use crate::now_ms;
use crate::primitives::block::{ALGORITHM_VELORA, Block};
use crate::primitives::transaction::{Transaction, TxTag};

/// At most this many mempool transactions per candidate.
pub const MAX_BLOCK_TXS: usize = 100;
/// Candidate payload ceiling, comfortably under the wire frame cap.
pub const MAX_BLOCK_BYTES: usize = 900 * 1024;
/// Nonces per cooperative stop check.
const NONCE_BATCH: u64 = 1_000;
/// Nonces per blocking stint before the async side re-checks the tip.
const STINT_NONCES: u64 = 200_000;
/// Hashrate window.
const HASHRATE_WINDOW_MS: u64 = 10_000;

pub struct Miner {
    chain: Arc<RwLock<Blockchain>>,
    mempool: Arc<Mutex<Mempool>>,
    address: String,
    stop: Arc<AtomicBool>,
    blocks_found: Arc<AtomicU64>,
    window_hashes: Arc<AtomicU64>,
    window_start: Arc<AtomicU64>,
    window_rate: Arc<AtomicU64>,
}

/// Build the next candidate block on top of the current tip.
pub fn build_candidate(
    chain: &Blockchain,
    mempool: &Mempool,
    miner_address: &str,
    now_ms: u64,
) -> Block {
    let parent = chain.tip();
    let height = parent.index + 1;
    // Strictly after the parent keeps the median-time-past rule satisfied
    // even when the local clock lags.
    let timestamp = now_ms.max(parent.timestamp + 1);

    let txs = mempool.select_for_block(MAX_BLOCK_TXS, MAX_BLOCK_BYTES);
    let fees: u64 = txs.iter().map(|tx| tx.fee).sum();
    let reward = chain.subsidy_at(height).saturating_add(fees);

    let coinbase = Transaction::coinbase(
        miner_address,
        reward,
        timestamp,
        format!("cb-{height}-{timestamp}"),
        height,
        TxTag::Coinbase,
    );
    let mut transactions = vec![coinbase];
    transactions.extend(txs);

    Block {
        index: height,
        timestamp,
        previous_hash: parent.hash.clone(),
        merkle_root: Block::compute_merkle_root(&transactions),
        nonce: 0,
        difficulty: chain.expected_difficulty(),
        transactions,
        hash: String::new(),
        algorithm: ALGORITHM_VELORA.to_string(),
    }
}

/// One bounded search stint. Returns the solved block, or the nonce to
/// resume from (None on stop or nonce-space exhaustion).
fn search_stint(
    mut block: Block,
    start_nonce: u64,
    pad: &[u32],
    stop: &AtomicBool,
    hashes: &AtomicU64,
) -> (Option<Block>, Option<u64>) {
    let target = velora::difficulty_to_target(block.difficulty);
    let mut nonce = start_nonce;
    let end = start_nonce.saturating_add(STINT_NONCES);

    while nonce < end {
        let batch_end = (nonce + NONCE_BATCH).min(end);
        while nonce < batch_end {
            let hash = velora::hash_with_pad(&block.pow_input(nonce), pad);
            if velora::hash_meets_target(&hash, &target) {
                block.nonce = nonce;
                block.hash = hex::encode(hash);
                hashes.fetch_add(nonce - start_nonce + 1, Ordering::Relaxed);
                return (Some(block), None);
            }
            nonce += 1;
        }
        if stop.load(Ordering::Relaxed) {
            hashes.fetch_add(nonce - start_nonce, Ordering::Relaxed);
            return (None, None);
        }
    }
    hashes.fetch_add(end - start_nonce, Ordering::Relaxed);
    if end == u64::MAX {
        // Nonce space exhausted: caller re-derives the timestamp.
        return (None, None);
    }
    (None, Some(end))
}

impl Miner {
    pub fn new(
        chain: Arc<RwLock<Blockchain>>,
        mempool: Arc<Mutex<Mempool>>,
        address: String,
    ) -> Self {
        Miner {
            chain,
            mempool,
            address,
            stop: Arc::new(AtomicBool::new(false)),
            blocks_found: Arc::new(AtomicU64::new(0)),
            window_hashes: Arc::new(AtomicU64::new(0)),
            window_start: Arc::new(AtomicU64::new(now_ms())),
            window_rate: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn blocks_found(&self) -> u64 {
        self.blocks_found.load(Ordering::Relaxed)
    }

    /// Hashes per second over the last window.
    pub fn hashrate(&self) -> u64 {
        self.window_rate.load(Ordering::Relaxed)
    }

    fn roll_hashrate_window(&self) {
        let now = now_ms();
        let start = self.window_start.load(Ordering::Relaxed);
        let elapsed = now.saturating_sub(start);
        if elapsed >= HASHRATE_WINDOW_MS {
            let hashes = self.window_hashes.swap(0, Ordering::Relaxed);
            self.window_start.store(now, Ordering::Relaxed);
            self.window_rate
                .store(hashes * 1000 / elapsed.max(1), Ordering::Relaxed);
        }
    }

    /// Mine until stopped. Every solved block is self-verified by the chain
    /// engine on submit, then announced to the network.
    pub async fn run(&self, node: Option<P2pNode>) {
        println!(
            "{} mining to {}",
            "[miner]".bright_magenta().bold(),
            self.address
        );

        'template: while !self.stop.load(Ordering::Relaxed) {
            let (candidate, pad, template_parent) = {
                let chain = self.chain.read().await;
                let mempool = self.mempool.lock().await;
                let candidate = build_candidate(&chain, &mempool, &self.address, now_ms());
                let pad = chain.engine().scratchpad(candidate.index);
                (candidate.clone(), pad, candidate.previous_hash.clone())
            };

            let mut next_nonce = 0u64;
            loop {
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }

                // A tip change from the network obsoletes this template.
                if self.chain.read().await.tip().hash != template_parent {
                    continue 'template;
                }

                let block = candidate.clone();
                let pad = pad.clone();
                let stop = self.stop.clone();
                let hashes = self.window_hashes.clone();
                let stint = tokio::task::spawn_blocking(move || {
                    search_stint(block, next_nonce, &pad, &stop, &hashes)
                })
                .await;
                self.roll_hashrate_window();

                match stint {
                    Ok((Some(solved), _)) => {
                        self.submit(solved, node.as_ref()).await;
                        continue 'template;
                    }
                    Ok((None, Some(resume))) => {
                        next_nonce = resume;
                    }
                    Ok((None, None)) => {
                        // Stopped, or nonce space exhausted — new timestamp.
                        continue 'template;
                    }
                    Err(_) => return,
                }
            }
        }
    }

    async fn submit(&self, block: Block, node: Option<&P2pNode>) {
        let outcome = {
            let mut chain = self.chain.write().await;
            chain.add_block(block.clone(), now_ms())
        };
        match outcome {
            Ok(AddOutcome::Appended) => {
                self.blocks_found.fetch_add(1, Ordering::Relaxed);
                println!(
                    "{} mined block {} ({} tx, difficulty {})",
                    "[miner]".bright_magenta().bold(),
                    block.index,
                    block.transactions.len(),
                    block.difficulty
                );
                self.mempool.lock().await.remove_confirmed(&block);
                if let Some(node) = node {
                    node.announce_block(block).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                // Lost a race against the network; the next template restarts
                // from the new tip.
                eprintln!("{} solved block rejected: {e}", "[miner]".yellow());
            }
        }
    }
}

/// Synchronous helper: mine `count` blocks into the chain. Test and
/// `--generate-genesis` style tooling, not the daemon path.
pub fn generate_blocks(
    chain: &mut Blockchain,
    mempool: &mut Mempool,
    engine: &VeloraEngine,
    miner_address: &str,
    count: u32,
) -> Vec<String> {
    let mut hashes = Vec::new();
    for _ in 0..count {
        let now = now_ms().max(chain.tip().timestamp + 1);
        let mut block = build_candidate(chain, mempool, miner_address, now);
        let target = velora::difficulty_to_target(block.difficulty);
        let pad = engine.scratchpad(block.index);

        let mut nonce = 0u64;
        loop {
            let hash = velora::hash_with_pad(&block.pow_input(nonce), &pad);
            if velora::hash_meets_target(&hash, &target) {
                block.nonce = nonce;
                block.hash = hex::encode(hash);
                break;
            }
            nonce += 1;
        }

        if chain.add_block(block.clone(), now).is_ok() {
            mempool.remove_confirmed(&block);
            hashes.push(block.hash);
        }
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::chain::test_support::test_params;
    use crate::crypto::keys::KeyPair;

    fn setup() -> (Blockchain, Mempool, VeloraEngine) {
        let engine = VeloraEngine::new();
        let chain = Blockchain::bootstrap(test_params("miner-test"), engine.clone());
        let mempool = Mempool::new(1024, 1);
        (chain, mempool, engine)
    }

    #[test]
    fn test_generate_blocks() {
        let (mut chain, mut mempool, engine) = setup();
        let miner = KeyPair::generate();

        let hashes = generate_blocks(&mut chain, &mut mempool, &engine, &miner.address(), 3);
        assert_eq!(hashes.len(), 3);
        assert_eq!(chain.height(), 3);
        assert!(chain.utxos().balance_of(&miner.address()) > 0);
    }

    #[test]
    fn test_candidate_shape() {
        let (chain, mempool, _engine) = setup();
        let miner = KeyPair::generate();

        let candidate = build_candidate(&chain, &mempool, &miner.address(), now_ms());
        assert_eq!(candidate.index, 1);
        assert_eq!(candidate.previous_hash, chain.tip().hash);
        assert!(candidate.transactions[0].is_coinbase);
        assert_eq!(candidate.difficulty, chain.expected_difficulty());
        assert!(candidate.timestamp > chain.tip().timestamp);
        assert_eq!(
            candidate.merkle_root,
            Block::compute_merkle_root(&candidate.transactions)
        );
    }

    #[test]
    fn test_mined_block_includes_mempool_txs() {
        let (mut chain, mut mempool, engine) = setup();
        let miner = KeyPair::generate();
        let dest = KeyPair::generate();

        generate_blocks(&mut chain, &mut mempool, &engine, &miner.address(), 1);
        let reward_tx = chain.block_by_index(1).unwrap().transactions[0].clone();

        let spend = crate::primitives::transaction::test_support::signed_spend(
            &miner,
            &reward_tx.id,
            0,
            &dest.address(),
            reward_tx.outputs[0].amount - 50,
            50,
            chain.tip().timestamp + 1,
            "spend-1",
        );
        mempool
            .submit(spend.clone(), chain.utxos(), chain.replay_registry(), spend.timestamp)
            .unwrap();

        generate_blocks(&mut chain, &mut mempool, &engine, &miner.address(), 1);

        let block = chain.block_by_index(2).unwrap();
        assert!(block.transactions.iter().any(|tx| tx.id == spend.id));
        // Included transaction leaves the pool.
        assert!(mempool.is_empty());
        // The coinbase claims subsidy plus the spend's fee.
        assert_eq!(
            block.transactions[0].outputs[0].amount,
            chain.subsidy_at(2) + 50
        );
    }

    #[test]
    fn test_search_stint_finds_at_difficulty_one() {
        let (chain, mempool, _engine) = setup();
        let miner = KeyPair::generate();
        let candidate = build_candidate(&chain, &mempool, &miner.address(), now_ms());
        let pad = chain.engine().scratchpad(candidate.index);

        let stop = AtomicBool::new(false);
        let hashes = AtomicU64::new(0);
        let (found, resume) = search_stint(candidate, 0, &pad, &stop, &hashes);
        assert!(found.is_some());
        assert!(resume.is_none());
        assert!(hashes.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_stop_flag_halts_search() {
        let (chain, mempool, _engine) = setup();
        let miner = KeyPair::generate();
        let mut candidate = build_candidate(&chain, &mempool, &miner.address(), now_ms());
        // Impossible difficulty so the search cannot finish on its own.
        candidate.difficulty = u64::MAX;
        let pad = chain.engine().scratchpad(candidate.index);

        let stop = AtomicBool::new(true);
        let hashes = AtomicU64::new(0);
        let (found, resume) = search_stint(candidate, 0, &pad, &stop, &hashes);
        assert!(found.is_none());
        assert!(resume.is_none(), "stop flag must end the stint");
    }
}
