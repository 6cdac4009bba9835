//! Transaction classifier.
//!
//! Turns a connected block into a [`ChargeRecord`] by decoding every output's
//! spending condition and looking the resulting address up in the
//! [`DepositAddressIndex`]. Classification is pure: it never touches the
//! network or the charge ledger.
//!
//! A transaction credits at most one user: the first deposit address it pays
//! decides the owner, and outputs to other users' addresses are ignored.

use crate::address_index::DepositAddressIndex;
use crate::charge::{ChargeKey, ChargeRecord};
use crate::script::{decode_script, SpendCondition};
use crate::types::{Block, UserId};

/// Outcome of classifying one block.
#[derive(Debug, Clone, Default)]
pub struct ClassifyResult {
    /// Deposits found in the block
    pub record: ChargeRecord,
    /// Number of outputs examined
    pub outputs_scanned: u64,
    /// Number of outputs that paid a deposit address
    pub deposits_found: u64,
    /// Outputs skipped because their script was malformed
    pub malformed_outputs: u64,
    /// Coinbase transactions skipped by policy
    pub coinbase_skipped: u64,
    /// Deposit outputs ignored because their value was not positive
    pub non_positive_outputs: u64,
    /// Deposit outputs ignored because the transaction already paid another user
    pub foreign_outputs: u64,
}

/// Extracts per-user deposit credits from blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionClassifier {
    include_coinbase: bool,
}

impl TransactionClassifier {
    pub fn new(include_coinbase: bool) -> Self {
        Self { include_coinbase }
    }

    pub fn includes_coinbase(&self) -> bool {
        self.include_coinbase
    }

    /// Classify every output of `block` against `index`.
    pub fn classify(&self, block: &Block, index: &DepositAddressIndex) -> ClassifyResult {
        let mut result = ClassifyResult::default();

        for tx in &block.transactions {
            if tx.is_coinbase && !self.include_coinbase {
                result.coinbase_skipped += 1;
                continue;
            }

            let mut owner: Option<UserId> = None;

            for (output_index, output) in tx.outputs.iter().enumerate() {
                result.outputs_scanned += 1;

                let fingerprint = match decode_script(&output.script) {
                    Ok(SpendCondition::AddressHash(fp)) => fp,
                    Ok(SpendCondition::Other) => continue,
                    Err(e) => {
                        result.malformed_outputs += 1;
                        tracing::debug!(
                            block = %block.hash.short(),
                            tx_id = %tx.txid,
                            output_index,
                            "Skipping output: {}",
                            e
                        );
                        continue;
                    }
                };

                let Some(user_id) = index.lookup(&fingerprint) else {
                    continue;
                };

                if output.value <= 0 {
                    result.non_positive_outputs += 1;
                    tracing::debug!(
                        block = %block.hash.short(),
                        tx_id = %tx.txid,
                        output_index,
                        value = output.value,
                        "Skipping non-positive deposit output"
                    );
                    continue;
                }

                match owner {
                    Some(first) if first != user_id => {
                        result.foreign_outputs += 1;
                        tracing::debug!(
                            block = %block.hash.short(),
                            tx_id = %tx.txid,
                            output_index,
                            user_id,
                            owner = first,
                            "Skipping output to a second user"
                        );
                        continue;
                    }
                    _ => owner = Some(user_id),
                }

                result
                    .record
                    .add(ChargeKey::new(user_id, tx.txid.clone()), output.value);
                result.deposits_found += 1;

                tracing::info!(
                    block = %block.hash.short(),
                    height = block.height,
                    user_id,
                    tx_id = %tx.txid,
                    amount = output.value,
                    "Deposit detected"
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{p2pkh_script, p2sh_script, AddressFingerprint};
    use crate::types::{BlockHash, Transaction, TxOutput};
    use std::collections::HashMap;

    fn index() -> DepositAddressIndex {
        let mut addresses = HashMap::new();
        addresses.insert(42, AddressFingerprint([1u8; 20]));
        addresses.insert(7, AddressFingerprint([2u8; 20]));
        DepositAddressIndex::from_addresses(addresses).unwrap()
    }

    fn output(fp: u8, value: i64) -> TxOutput {
        TxOutput {
            value,
            script: p2pkh_script(&AddressFingerprint([fp; 20])),
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            hash: BlockHash([9u8; 32]),
            prev_hash: BlockHash([8u8; 32]),
            height: 10,
            transactions,
        }
    }

    #[test]
    fn test_classify_accumulates_outputs() {
        let b = block(vec![
            Transaction {
                txid: "tx1".into(),
                is_coinbase: false,
                outputs: vec![output(1, 300), output(3, 999), output(1, 200)],
            },
            Transaction {
                txid: "tx2".into(),
                is_coinbase: false,
                outputs: vec![TxOutput {
                    value: 50,
                    script: p2sh_script(&AddressFingerprint([2u8; 20])),
                }],
            },
        ]);

        let result = TransactionClassifier::new(false).classify(&b, &index());
        assert_eq!(result.outputs_scanned, 4);
        assert_eq!(result.deposits_found, 3);
        assert_eq!(result.record.len(), 2);
        assert_eq!(
            result.record.get(&ChargeKey::new(42, "tx1")).unwrap().amount,
            500
        );
        assert_eq!(result.record.get(&ChargeKey::new(7, "tx2")).unwrap().amount, 50);
        assert!(result.record.iter().all(|(_, e)| !e.synced));
    }

    #[test]
    fn test_malformed_output_is_skipped() {
        let b = block(vec![Transaction {
            txid: "tx1".into(),
            is_coinbase: false,
            outputs: vec![
                TxOutput {
                    value: 10,
                    script: vec![0x76, 0xa9, 0x14, 0x01],
                },
                output(1, 500),
            ],
        }]);

        let result = TransactionClassifier::new(false).classify(&b, &index());
        assert_eq!(result.malformed_outputs, 1);
        assert_eq!(result.record.len(), 1);
    }

    #[test]
    fn test_coinbase_policy() {
        let b = block(vec![Transaction {
            txid: "cb".into(),
            is_coinbase: true,
            outputs: vec![output(1, 5000)],
        }]);

        let excluded = TransactionClassifier::new(false).classify(&b, &index());
        assert!(excluded.record.is_empty());
        assert_eq!(excluded.coinbase_skipped, 1);

        let included = TransactionClassifier::new(true).classify(&b, &index());
        assert_eq!(included.record.len(), 1);
    }

    #[test]
    fn test_transaction_credits_only_first_user() {
        let b = block(vec![Transaction {
            txid: "tx1".into(),
            is_coinbase: false,
            outputs: vec![output(3, 10), output(1, 500), output(2, 300), output(1, 25)],
        }]);

        let result = TransactionClassifier::new(false).classify(&b, &index());
        let users: Vec<UserId> = result.record.iter().map(|(k, _)| k.user_id).collect();
        assert_eq!(users, vec![42]);
        assert_eq!(
            result.record.get(&ChargeKey::new(42, "tx1")).unwrap().amount,
            525
        );
        assert_eq!(result.deposits_found, 2);
        assert_eq!(result.foreign_outputs, 1);
    }

    #[test]
    fn test_owner_is_tracked_per_transaction() {
        let b = block(vec![
            Transaction {
                txid: "tx1".into(),
                is_coinbase: false,
                outputs: vec![output(2, 300), output(1, 500)],
            },
            Transaction {
                txid: "tx2".into(),
                is_coinbase: false,
                outputs: vec![output(1, 70)],
            },
        ]);

        let result = TransactionClassifier::new(false).classify(&b, &index());
        assert_eq!(result.record.len(), 2);
        assert_eq!(result.record.get(&ChargeKey::new(7, "tx1")).unwrap().amount, 300);
        assert!(result.record.get(&ChargeKey::new(42, "tx1")).is_none());
        assert_eq!(result.record.get(&ChargeKey::new(42, "tx2")).unwrap().amount, 70);
    }

    #[test]
    fn test_non_positive_outputs_are_skipped() {
        let b = block(vec![Transaction {
            txid: "tx1".into(),
            is_coinbase: false,
            outputs: vec![output(1, 0), output(1, -40), output(2, 0)],
        }]);

        let result = TransactionClassifier::new(false).classify(&b, &index());
        assert!(result.record.is_empty());
        assert_eq!(result.non_positive_outputs, 3);
        assert_eq!(result.deposits_found, 0);
    }

    #[test]
    fn test_zero_output_does_not_claim_transaction() {
        let b = block(vec![Transaction {
            txid: "tx1".into(),
            is_coinbase: false,
            outputs: vec![output(2, 0), output(1, 500)],
        }]);

        let result = TransactionClassifier::new(false).classify(&b, &index());
        assert_eq!(result.record.get(&ChargeKey::new(42, "tx1")).unwrap().amount, 500);
        assert_eq!(result.record.len(), 1);
    }

    #[test]
    fn test_block_without_deposits_yields_empty_record() {
        let b = block(vec![Transaction {
            txid: "tx1".into(),
            is_coinbase: false,
            outputs: vec![output(5, 100)],
        }]);
        assert!(TransactionClassifier::default()
            .classify(&b, &index())
            .record
            .is_empty());
    }
}
