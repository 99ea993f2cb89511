// Genesis block construction.
//
// Deterministic from config: the premine coinbase is the only transaction,
// so the Merkle root is its id. A config that ships nonce and hash is a
// "configuration compact" — every node trusts the pair verbatim and ends up
// with an identical block. Without them the genesis is mined here, against
// the capped genesis target.

use crate::config::GenesisConfig;
use crate::crypto::velora::{self, VeloraEngine};
use crate::primitives::block::{ALGORITHM_VELORA, Block, GENESIS_PREVIOUS_HASH};
use crate::primitives::transaction::{Transaction, TxTag};

pub fn create_genesis_block(config: &GenesisConfig, engine: &VeloraEngine) -> Block {
    let coinbase = Transaction::coinbase(
        &config.premine_address,
        config.premine_amount,
        config.timestamp,
        config.coinbase_nonce.clone(),
        config.coinbase_atomic_sequence,
        TxTag::Premine,
    );

    let mut block = Block {
        index: 0,
        timestamp: config.timestamp,
        previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        merkle_root: coinbase.id.clone(),
        nonce: config.nonce.unwrap_or(0),
        difficulty: config.difficulty,
        transactions: vec![coinbase],
        hash: String::new(),
        algorithm: ALGORITHM_VELORA.to_string(),
    };

    if let (Some(nonce), Some(hash)) = (config.nonce, config.hash.as_ref()) {
        block.nonce = nonce;
        block.hash = hash.clone();
        return block;
    }

    mine_genesis(&mut block, engine);
    block
}

fn mine_genesis(block: &mut Block, engine: &VeloraEngine) {
    let target = velora::genesis_target(block.difficulty);
    let pad = engine.scratchpad(0);

    let mut nonce = 0u64;
    loop {
        let hash = velora::hash_with_pad(&block.pow_input(nonce), &pad);
        if velora::hash_meets_target(&hash, &target) {
            block.nonce = nonce;
            block.hash = hex::encode(hash);
            return;
        }
        nonce = nonce.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisConfig;

    fn easy_config() -> GenesisConfig {
        GenesisConfig {
            difficulty: 1,
            ..GenesisConfig::default()
        }
    }

    #[test]
    fn test_genesis_structure() {
        let engine = VeloraEngine::new();
        let genesis = create_genesis_block(&easy_config(), &engine);

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase);
        assert_eq!(genesis.merkle_root, genesis.transactions[0].id);
        assert!(!genesis.hash.is_empty());
    }

    #[test]
    fn test_genesis_deterministic() {
        let engine = VeloraEngine::new();
        let a = create_genesis_block(&easy_config(), &engine);
        let b = create_genesis_block(&easy_config(), &engine);
        assert_eq!(a, b);
    }

    #[test]
    fn test_mined_genesis_verifies() {
        let engine = VeloraEngine::new();
        let genesis = create_genesis_block(&easy_config(), &engine);

        let recomputed = engine.hash(&genesis.pow_input(genesis.nonce));
        assert_eq!(hex::encode(recomputed), genesis.hash);
        assert!(velora::hash_meets_target(
            &recomputed,
            &velora::genesis_target(genesis.difficulty)
        ));
    }

    #[test]
    fn test_supplied_nonce_and_hash_trusted() {
        let engine = VeloraEngine::new();
        let mut config = easy_config();
        config.nonce = Some(12345);
        config.hash = Some("ab".repeat(32));

        let genesis = create_genesis_block(&config, &engine);
        assert_eq!(genesis.nonce, 12345);
        assert_eq!(genesis.hash, "ab".repeat(32));
    }

    #[test]
    fn test_premine_lands_on_configured_address() {
        let engine = VeloraEngine::new();
        let config = easy_config();
        let genesis = create_genesis_block(&config, &engine);
        let out = &genesis.transactions[0].outputs[0];
        assert_eq!(out.address, config.premine_address);
        assert_eq!(out.amount, config.premine_amount);
    }
}
