//! Ed25519 cryptographic operations for the Strata protocol.
//!
//! Provides key generation, transaction input signing and verification, and
//! the staker's block signature. Uses ed25519-dalek for Ed25519 and BLAKE3
//! for pubkey hashing and signing hashes.
//!
//! # Signing scheme
//!
//! Transaction inputs are signed using a **sighash** that commits to:
//! - Transaction version, time and lock_time
//! - All input outpoints and sequences
//! - All outputs (value + locking script)
//! - The index of the input being signed
//!
//! Unlocking scripts are excluded from the sighash to avoid circularity and
//! allow inputs to be signed independently in any order.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{CryptoError, ScriptError};
use crate::script::{self, ScriptKind};
use crate::types::{Block, Hash256, Transaction};

/// Domain tag mixed into every transaction sighash.
const SIGHASH_TAG: &[u8] = b"strata/sighash/v1";

/// Ed25519 keypair for signing transactions and blocks.
///
/// Wraps [`ed25519_dalek::SigningKey`]. Use [`KeyPair::generate`] for random
/// keys or [`KeyPair::from_secret_bytes`] for deterministic test keys.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Get the raw secret key bytes (32 bytes). Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// The pay-to-pubkey-hash locking script for this key.
    pub fn locking_script(&self) -> Vec<u8> {
        script::p2pkh(&self.public_key().pubkey_hash())
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key for verifying signatures.
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Create a public key from raw bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Compute the BLAKE3 pubkey hash used in locking scripts.
    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.to_bytes())
    }

    /// Verify an Ed25519 signature on a message.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Compute the BLAKE3 pubkey hash from raw public key bytes.
pub fn pubkey_hash(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

/// Compute the signing hash (sighash) for a transaction input.
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(SIGHASH_TAG);
    hasher.update(&tx.version.to_le_bytes());
    hasher.update(&tx.time.to_le_bytes());

    hasher.update(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        hasher.update(input.previous_output.txid.as_bytes());
        hasher.update(&input.previous_output.index.to_le_bytes());
        hasher.update(&input.sequence.to_le_bytes());
    }

    hasher.update(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        hasher.update(&output.value.to_le_bytes());
        hasher.update(&(output.script_pubkey.len() as u64).to_le_bytes());
        hasher.update(&output.script_pubkey);
    }

    hasher.update(&tx.lock_time.to_le_bytes());
    hasher.update(&(input_index as u64).to_le_bytes());

    Ok(Hash256(hasher.finalize().into()))
}

/// Sign a transaction input in place, writing its unlocking script.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index)?;
    let signature = keypair.sign(sighash.as_bytes());
    let pubkey = keypair.public_key().to_bytes();
    tx.inputs[input_index].script_sig = script::unlocking_script(&signature, &pubkey);
    Ok(())
}

/// Verify that input `input_index` of `tx` unlocks `locking_script`.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    locking_script: &[u8],
) -> Result<(), ScriptError> {
    let expected = match script::classify(locking_script) {
        ScriptKind::PayToPubkeyHash(hash) => hash,
        ScriptKind::Unspendable => return Err(ScriptError::Unspendable),
        ScriptKind::NonStandard => return Err(ScriptError::UnsupportedLockingScript),
    };
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        })?;
    let (signature, pubkey_bytes) = script::parse_unlocking(&input.script_sig)?;
    let pk = PublicKey::from_bytes(&pubkey_bytes)?;
    if pk.pubkey_hash() != expected {
        return Err(CryptoError::PubkeyHashMismatch.into());
    }
    let sighash = signing_hash(tx, input_index)?;
    pk.verify(sighash.as_bytes(), &signature)?;
    Ok(())
}

/// Sign a block hash as the staker.
pub fn sign_block(block: &mut Block, keypair: &KeyPair) {
    let signature = keypair.sign(block.hash().as_bytes());
    block.signature = script::unlocking_script(&signature, &keypair.public_key().to_bytes());
}

/// Verify the staker's signature against the locking script of the staked output.
pub fn verify_block_signature(block: &Block, locking_script: &[u8]) -> Result<(), ScriptError> {
    let expected = match script::classify(locking_script) {
        ScriptKind::PayToPubkeyHash(hash) => hash,
        ScriptKind::Unspendable => return Err(ScriptError::Unspendable),
        ScriptKind::NonStandard => return Err(ScriptError::UnsupportedLockingScript),
    };
    let (signature, pubkey_bytes) = script::parse_unlocking(&block.signature)?;
    let pk = PublicKey::from_bytes(&pubkey_bytes)?;
    if pk.pubkey_hash() != expected {
        return Err(CryptoError::PubkeyHashMismatch.into());
    }
    pk.verify(block.hash().as_bytes(), &signature)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::types::{BlockHeader, OutPoint, TxInput, TxOutput};

    // --- KeyPair ---

    #[test]
    fn keypair_from_secret_deterministic() {
        let kp1 = KeyPair::from_secret_bytes([42u8; 32]);
        let kp2 = KeyPair::from_secret_bytes([42u8; 32]);
        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_ne!(kp1.public_key(), KeyPair::from_secret_bytes([43u8; 32]).public_key());
    }

    #[test]
    fn keypair_debug_hides_secret() {
        let kp = KeyPair::generate();
        let debug = format!("{kp:?}");
        assert!(debug.contains("public_key"));
        assert!(!debug.contains(&hex::encode(kp.secret_bytes())));
    }

    #[test]
    fn pubkey_serde_json_roundtrip() {
        let pk = KeyPair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        let pk2: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, pk2);
    }

    #[test]
    fn locking_script_commits_to_pubkey_hash() {
        let kp = KeyPair::from_secret_bytes([5; 32]);
        assert_eq!(
            script::classify(&kp.locking_script()),
            ScriptKind::PayToPubkeyHash(kp.public_key().pubkey_hash())
        );
    }

    // --- Signing hash ---

    fn unsigned_tx(kp: &KeyPair) -> Transaction {
        Transaction {
            version: 1,
            time: 1_700_000_000,
            inputs: vec![
                TxInput::new(OutPoint::new(Hash256([0x11; 32]), 0), vec![]),
                TxInput::new(OutPoint::new(Hash256([0x12; 32]), 3), vec![]),
            ],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                script_pubkey: kp.locking_script(),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn signing_hash_changes_with_index_and_time() {
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let tx = unsigned_tx(&kp);
        assert_ne!(signing_hash(&tx, 0).unwrap(), signing_hash(&tx, 1).unwrap());
        let mut later = tx.clone();
        later.time += 1;
        assert_ne!(signing_hash(&tx, 0).unwrap(), signing_hash(&later, 0).unwrap());
    }

    #[test]
    fn signing_hash_excludes_unlocking_scripts() {
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let mut tx = unsigned_tx(&kp);
        let before = signing_hash(&tx, 0).unwrap();
        tx.inputs[1].script_sig = vec![9; 96];
        assert_eq!(before, signing_hash(&tx, 0).unwrap());
    }

    #[test]
    fn signing_hash_out_of_bounds() {
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let tx = unsigned_tx(&kp);
        assert_eq!(
            signing_hash(&tx, 2),
            Err(CryptoError::InputIndexOutOfBounds { index: 2, len: 2 })
        );
    }

    // --- Input verification ---

    #[test]
    fn sign_verify_all_inputs() {
        let kp = KeyPair::from_secret_bytes([3; 32]);
        let mut tx = unsigned_tx(&kp);
        sign_transaction_input(&mut tx, 0, &kp).unwrap();
        sign_transaction_input(&mut tx, 1, &kp).unwrap();
        let lock = kp.locking_script();
        verify_transaction_input(&tx, 0, &lock).unwrap();
        verify_transaction_input(&tx, 1, &lock).unwrap();
    }

    #[test]
    fn verify_fails_for_other_owner() {
        let kp = KeyPair::from_secret_bytes([3; 32]);
        let other = KeyPair::from_secret_bytes([4; 32]);
        let mut tx = unsigned_tx(&kp);
        sign_transaction_input(&mut tx, 0, &kp).unwrap();
        assert_eq!(
            verify_transaction_input(&tx, 0, &other.locking_script()),
            Err(ScriptError::Crypto(CryptoError::PubkeyHashMismatch))
        );
    }

    #[test]
    fn verify_fails_after_tamper() {
        let kp = KeyPair::from_secret_bytes([3; 32]);
        let mut tx = unsigned_tx(&kp);
        sign_transaction_input(&mut tx, 0, &kp).unwrap();
        tx.outputs[0].value -= 1;
        assert_eq!(
            verify_transaction_input(&tx, 0, &kp.locking_script()),
            Err(ScriptError::Crypto(CryptoError::VerificationFailed))
        );
    }

    #[test]
    fn verify_rejects_unspendable_and_malformed() {
        let kp = KeyPair::from_secret_bytes([3; 32]);
        let mut tx = unsigned_tx(&kp);
        assert_eq!(
            verify_transaction_input(&tx, 0, &script::unspendable(b"x")),
            Err(ScriptError::Unspendable)
        );
        assert_eq!(
            verify_transaction_input(&tx, 0, &[1, 2, 3]),
            Err(ScriptError::UnsupportedLockingScript)
        );
        tx.inputs[0].script_sig = vec![0; 10];
        assert_eq!(
            verify_transaction_input(&tx, 0, &kp.locking_script()),
            Err(ScriptError::MalformedUnlockingScript)
        );
    }

    // --- Block signature ---

    #[test]
    fn block_signature_roundtrip() {
        let kp = KeyPair::from_secret_bytes([8; 32]);
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256([1; 32]),
                merkle_root: Hash256([2; 32]),
                time: 100,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: vec![],
            signature: vec![],
        };
        sign_block(&mut block, &kp);
        verify_block_signature(&block, &kp.locking_script()).unwrap();

        block.header.time += 1;
        assert!(verify_block_signature(&block, &kp.locking_script()).is_err());
    }
}
