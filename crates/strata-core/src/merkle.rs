//! BLAKE3 Merkle tree for transaction commitment.
//!
//! Uses domain-separated hashing:
//! - Leaf hash: `BLAKE3(0x00 || txid)`
//! - Internal node: `BLAKE3(0x01 || left || right)`
//!
//! Odd-length layers are padded by duplicating the last element. That makes
//! `[a, b, c]` and `[a, b, c, c]` commit to the same root, so the root
//! computation also reports whether any layer paired two identical hashes.
//! A block whose root is "mutated" is rejected before the root is compared.
//! Empty trees produce [`Hash256::ZERO`].

use crate::types::Hash256;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Compute a domain-separated leaf hash: `BLAKE3(0x00 || data)`.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute a domain-separated internal node hash: `BLAKE3(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute the Merkle root from a slice of leaf values (typically transaction IDs).
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    merkle_root_checked(leaves).0
}

/// Compute the Merkle root and whether two identical siblings were paired.
pub fn merkle_root_checked(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return (Hash256::ZERO, false);
    }

    let mut mutated = false;
    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();

    while current.len() > 1 {
        let (next, dup) = next_layer(&current);
        mutated |= dup;
        current = next;
    }

    (current[0], mutated)
}

/// Pair adjacent hashes with [`node_hash`], duplicating a trailing odd element.
fn next_layer(layer: &[Hash256]) -> (Vec<Hash256>, bool) {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut mutated = false;
    for pair in layer.chunks(2) {
        let left = &pair[0];
        let right = match pair.get(1) {
            Some(right) => {
                mutated |= right == left;
                right
            }
            None => left,
        };
        next.push(node_hash(left, right));
    }
    (next, mutated)
}
