//! Structural decoding of output spending conditions.
//!
//! Scripts are tokenized into opcodes and pushes and then matched against
//! the two address-hash templates. A deposit is only ever recognized from a
//! decoded template, never from a byte pattern found somewhere inside the
//! script.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;

/// Length of an address hash.
pub const FINGERPRINT_LEN: usize = 20;

/// Hash identifying a deposit address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressFingerprint(pub [u8; FINGERPRINT_LEN]);

impl fmt::Display for AddressFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AddressFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressFingerprint({})", self)
    }
}

impl FromStr for AddressFingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid fingerprint hex: {}", e))?;
        let arr: [u8; FINGERPRINT_LEN] = bytes.as_slice().try_into().map_err(|_| {
            format!(
                "fingerprint must be {} bytes, got {}",
                FINGERPRINT_LEN,
                bytes.len()
            )
        })?;
        Ok(Self(arr))
    }
}

impl Serialize for AddressFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AddressFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Typed result of decoding an output script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendCondition {
    /// Pay-to-pubkey-hash or pay-to-script-hash
    AddressHash(AddressFingerprint),
    /// Any other well-formed script
    Other,
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Op(u8),
    Push(&'a [u8]),
}

fn tokenize(script: &[u8]) -> Result<Vec<Token<'_>>, SyncError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;

        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => read_len(script, &mut pos, 1)?,
            OP_PUSHDATA2 => read_len(script, &mut pos, 2)?,
            OP_PUSHDATA4 => read_len(script, &mut pos, 4)?,
            _ => {
                tokens.push(Token::Op(opcode));
                continue;
            }
        };

        let end = pos
            .checked_add(len)
            .filter(|end| *end <= script.len())
            .ok_or_else(|| {
                SyncError::Classification(format!(
                    "push of {} bytes at offset {} overruns {}-byte script",
                    len,
                    pos,
                    script.len()
                ))
            })?;
        tokens.push(Token::Push(&script[pos..end]));
        pos = end;
    }

    Ok(tokens)
}

fn read_len(script: &[u8], pos: &mut usize, width: usize) -> Result<usize, SyncError> {
    let bytes = script.get(*pos..*pos + width).ok_or_else(|| {
        SyncError::Classification(format!("truncated push length at offset {}", *pos))
    })?;
    *pos += width;
    Ok(bytes
        .iter()
        .rev()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

fn fingerprint(data: &[u8]) -> Option<AddressFingerprint> {
    data.try_into().ok().map(AddressFingerprint)
}

/// Decode a script into a [`SpendCondition`].
///
/// Fails only when the script is malformed (a push overruns the script).
pub fn decode_script(script: &[u8]) -> Result<SpendCondition, SyncError> {
    let tokens = tokenize(script)?;

    let condition = match tokens.as_slice() {
        [Token::Op(OP_DUP), Token::Op(OP_HASH160), Token::Push(hash), Token::Op(OP_EQUALVERIFY), Token::Op(OP_CHECKSIG)] => {
            fingerprint(hash).map(SpendCondition::AddressHash)
        }
        [Token::Op(OP_HASH160), Token::Push(hash), Token::Op(OP_EQUAL)] => {
            fingerprint(hash).map(SpendCondition::AddressHash)
        }
        _ => None,
    };

    Ok(condition.unwrap_or(SpendCondition::Other))
}

/// Build a pay-to-pubkey-hash script for `fingerprint`.
pub fn p2pkh_script(fingerprint: &AddressFingerprint) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, FINGERPRINT_LEN as u8]);
    script.extend_from_slice(&fingerprint.0);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// Build a pay-to-script-hash script for `fingerprint`.
pub fn p2sh_script(fingerprint: &AddressFingerprint) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, FINGERPRINT_LEN as u8]);
    script.extend_from_slice(&fingerprint.0);
    script.push(OP_EQUAL);
    script
}
