//! Locking and unlocking script templates.
//!
//! Strata supports one spendable template, pay-to-pubkey-hash:
//! `[OP_P2PKH] || BLAKE3(pubkey)`, unlocked by `signature(64) || pubkey(32)`.
//! Outputs starting with `OP_RETURN` are provably unspendable. Anything else is
//! carried but can never be spent and is non-standard for relay.

use crate::error::ScriptError;
use crate::types::Hash256;

pub const OP_RETURN: u8 = 0x6a;
pub const OP_P2PKH: u8 = 0x76;
pub const OP_CHECKSIG: u8 = 0xac;

/// Length of a pay-to-pubkey-hash locking script.
pub const P2PKH_LEN: usize = 33;

/// Length of an unlocking script: 64-byte signature followed by 32-byte key.
pub const UNLOCKING_LEN: usize = 96;

/// Largest `OP_RETURN` payload relayed.
pub const MAX_OP_RETURN_RELAY: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PayToPubkeyHash(Hash256),
    Unspendable,
    NonStandard,
}

pub fn p2pkh(pubkey_hash: &Hash256) -> Vec<u8> {
    let mut script = Vec::with_capacity(P2PKH_LEN);
    script.push(OP_P2PKH);
    script.extend_from_slice(pubkey_hash.as_bytes());
    script
}

pub fn unspendable(data: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(1 + data.len());
    script.push(OP_RETURN);
    script.extend_from_slice(data);
    script
}

pub fn classify(script: &[u8]) -> ScriptKind {
    match script.first() {
        Some(&OP_P2PKH) if script.len() == P2PKH_LEN => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&script[1..]);
            ScriptKind::PayToPubkeyHash(Hash256(hash))
        }
        Some(&OP_RETURN) => ScriptKind::Unspendable,
        _ => ScriptKind::NonStandard,
    }
}

/// Whether the pool relays outputs locked by this script.
pub fn is_standard_locking(script: &[u8]) -> bool {
    match classify(script) {
        ScriptKind::PayToPubkeyHash(_) => true,
        ScriptKind::Unspendable => script.len() <= 1 + MAX_OP_RETURN_RELAY,
        ScriptKind::NonStandard => false,
    }
}

pub fn unlocking_script(signature: &[u8; 64], pubkey: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(UNLOCKING_LEN);
    script.extend_from_slice(signature);
    script.extend_from_slice(pubkey);
    script
}

/// Split an unlocking script into signature and public key bytes.
pub fn parse_unlocking(script: &[u8]) -> Result<([u8; 64], [u8; 32]), ScriptError> {
    if script.len() != UNLOCKING_LEN {
        return Err(ScriptError::MalformedUnlockingScript);
    }
    let mut signature = [0u8; 64];
    let mut pubkey = [0u8; 32];
    signature.copy_from_slice(&script[..64]);
    pubkey.copy_from_slice(&script[64..]);
    Ok((signature, pubkey))
}

/// Legacy-style signature operation count.
///
/// Each pay-to-pubkey-hash output costs one; other scripts are charged for
/// every `OP_CHECKSIG` byte they contain. Unlocking scripts cost nothing.
pub fn sigop_count(script: &[u8]) -> usize {
    match classify(script) {
        ScriptKind::PayToPubkeyHash(_) => 1,
        ScriptKind::Unspendable => 0,
        ScriptKind::NonStandard => {
            if script.len() == UNLOCKING_LEN {
                0
            } else {
                script.iter().filter(|&&b| b == OP_CHECKSIG).count()
            }
        }
    }
}

/// Height commitment placed at the start of a coinbase unlocking script.
///
/// One length byte followed by the minimal little-endian encoding.
pub fn encode_height(height: u32) -> Vec<u8> {
    let bytes = height.to_le_bytes();
    let len = 4 - bytes.iter().rev().take_while(|&&b| b == 0).count();
    let len = len.max(1);
    let mut out = Vec::with_capacity(1 + len);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
    out
}
