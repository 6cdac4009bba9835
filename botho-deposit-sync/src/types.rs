//! Chain and ledger domain types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// External user identifier owning a deposit address.
pub type UserId = i64;

/// Opaque idempotency token ("business id") attached to ledger updates.
pub type BusinessId = i64;

/// 32-byte block identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Raw bytes, used as the durable store key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for BlockHash {
    type Error = String;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("block hash must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.short())
    }
}

impl FromStr for BlockHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid block hash hex: {}", e))?;
        Self::try_from(bytes.as_slice())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Direction of a balance update sent to the ledger service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Deposit credited when its block matures on the main chain
    Credit,
    /// Reversal of a credit whose block was orphaned
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Current best-chain tip as reported by the chain engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u64,
}

/// A transaction output as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Output value in base units
    pub value: i64,
    /// Raw spending condition
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

/// A transaction inside a connected block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default, rename = "coinbase")]
    pub is_coinbase: bool,
    pub outputs: Vec<TxOutput>,
}

/// A block as delivered to `on_block_connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: BlockHash,
    #[serde(rename = "prevHash")]
    pub prev_hash: BlockHash,
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_hex() {
        let hash = BlockHash([0xab; 32]);
        let parsed: BlockHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.short(), "abababababababab");
        assert!("abcd".parse::<BlockHash>().is_err());
    }

    #[test]
    fn test_block_from_rpc_json() {
        let json = serde_json::json!({
            "hash": "11".repeat(32),
            "prevHash": "00".repeat(32),
            "height": 7,
            "transactions": [{
                "txid": "tx1",
                "coinbase": false,
                "outputs": [{ "value": 500, "script": "76a914" }]
            }]
        });

        let block: Block = serde_json::from_value(json).unwrap();
        assert_eq!(block.height, 7);
        assert_eq!(block.hash, BlockHash([0x11; 32]));
        assert_eq!(block.transactions[0].outputs[0].script, vec![0x76, 0xa9, 0x14]);
        assert!(!block.transactions[0].is_coinbase);
    }
}
