// Local wallet keystore.
//
// One keypair in a 0600 JSON file, created on first use. The wallet builds
// and signs spend transactions by greedy coin selection over the node's own
// UTXO view; change returns to the wallet address.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consensus::utxo::UtxoSet;
use crate::crypto::keys::{self, KeyPair};
use crate::primitives::transaction::{
    DEFAULT_TX_TTL_MS, Transaction, TransactionInput, TransactionOutput, TxTag,
};

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt wallet file")]
    Corrupt,
    #[error("recipient address invalid")]
    InvalidAddress,
    #[error("wallet balance cannot cover amount plus fee")]
    InsufficientFunds,
}

#[derive(Serialize, Deserialize)]
struct WalletFile {
    address: String,
    private_key: String,
    created_at: u64,
}

pub struct Wallet {
    pub keypair: KeyPair,
}

impl Wallet {
    /// Load the wallet file, or create and persist a new keypair.
    pub fn load_or_create(path: &Path, now_ms: u64) -> Result<Self, WalletError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let file: WalletFile = serde_json::from_str(&raw).map_err(|_| WalletError::Corrupt)?;
            let keypair =
                KeyPair::from_secret_hex(&file.private_key).map_err(|_| WalletError::Corrupt)?;
            return Ok(Wallet { keypair });
        }

        let wallet = Wallet {
            keypair: KeyPair::generate(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = WalletFile {
            address: wallet.address(),
            private_key: wallet.keypair.secret_hex(),
            created_at: now_ms,
        };
        std::fs::write(
            path,
            serde_json::to_string_pretty(&file).map_err(|_| WalletError::Corrupt)?,
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(wallet)
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }

    /// Build and sign a spend of `amount` to `to`, funded greedily from this
    /// wallet's unspent outputs. Change above zero returns to the wallet.
    pub fn build_transaction(
        &self,
        utxos: &UtxoSet,
        to: &str,
        amount: u64,
        fee: u64,
        now_ms: u64,
    ) -> Result<Transaction, WalletError> {
        if keys::validate_address(to).is_err() {
            return Err(WalletError::InvalidAddress);
        }
        let needed = amount
            .checked_add(fee)
            .ok_or(WalletError::InsufficientFunds)?;

        let mut inputs = Vec::new();
        let mut gathered = 0u64;
        for (outpoint, utxo) in utxos.outputs_of(&self.address()) {
            inputs.push(TransactionInput {
                tx_id: outpoint.tx_id,
                output_index: outpoint.output_index,
                signature: String::new(),
                public_key: String::new(),
            });
            gathered = gathered.saturating_add(utxo.amount);
            if gathered >= needed {
                break;
            }
        }
        if gathered < needed {
            return Err(WalletError::InsufficientFunds);
        }

        let mut outputs = vec![TransactionOutput {
            address: to.to_string(),
            amount,
            tag: TxTag::Transaction,
        }];
        let change = gathered - needed;
        if change > 0 {
            outputs.push(TransactionOutput {
                address: self.address(),
                amount: change,
                tag: TxTag::Transaction,
            });
        }

        let mut nonce_bytes = [0u8; 16];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| WalletError::Io(std::io::Error::other(e.to_string())))?;

        let mut tx = Transaction {
            id: String::new(),
            inputs,
            outputs,
            fee,
            timestamp: now_ms,
            nonce: hex::encode(nonce_bytes),
            expires_at: now_ms + DEFAULT_TX_TTL_MS,
            sequence: 0,
            is_coinbase: false,
            tag: TxTag::Transaction,
        };
        tx.sign_inputs(&self.keypair);
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::validate::validate_transaction;

    const NOW: u64 = 1_700_000_000_000;

    fn funded_wallet(amounts: &[u64]) -> (Wallet, UtxoSet) {
        let dir = tempfile::tempdir().unwrap();
        let wallet = Wallet::load_or_create(&dir.path().join("wallet.json"), NOW).unwrap();
        let mut utxos = UtxoSet::new();
        for (i, amount) in amounts.iter().enumerate() {
            let cb = Transaction::coinbase(
                &wallet.address(),
                *amount,
                NOW,
                format!("cb-{i}"),
                i as u64,
                TxTag::Coinbase,
            );
            utxos.apply_transaction(&cb, 0);
        }
        (wallet, utxos)
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let first = Wallet::load_or_create(&path, NOW).unwrap();
        let second = Wallet::load_or_create(&path, NOW + 1).unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn test_build_valid_spend_with_change() {
        let (wallet, utxos) = funded_wallet(&[10_000]);
        let dest = KeyPair::generate().address();

        let tx = wallet
            .build_transaction(&utxos, &dest, 4_000, 100, NOW)
            .unwrap();
        assert_eq!(tx.outputs[0].amount, 4_000);
        assert_eq!(tx.outputs[1].amount, 5_900, "change = 10000 - 4000 - 100");
        assert_eq!(tx.outputs[1].address, wallet.address());

        validate_transaction(&tx, &utxos, NOW, 100, None).unwrap();
    }

    #[test]
    fn test_multiple_inputs_gathered() {
        let (wallet, utxos) = funded_wallet(&[3_000, 3_000, 3_000]);
        let dest = KeyPair::generate().address();

        let tx = wallet
            .build_transaction(&utxos, &dest, 5_000, 100, NOW)
            .unwrap();
        assert!(tx.inputs.len() >= 2);
        validate_transaction(&tx, &utxos, NOW, 100, None).unwrap();
    }

    #[test]
    fn test_insufficient_funds() {
        let (wallet, utxos) = funded_wallet(&[1_000]);
        let dest = KeyPair::generate().address();
        assert!(matches!(
            wallet.build_transaction(&utxos, &dest, 5_000, 100, NOW),
            Err(WalletError::InsufficientFunds)
        ));
    }

    #[test]
    fn test_bad_recipient_rejected() {
        let (wallet, utxos) = funded_wallet(&[10_000]);
        assert!(matches!(
            wallet.build_transaction(&utxos, "not-an-address", 100, 10, NOW),
            Err(WalletError::InvalidAddress)
        ));
    }
}
