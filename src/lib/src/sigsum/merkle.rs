//! Merkle tree hashing and inclusion proofs (RFC 6962 hashes, RFC 9162 verification)
//!
//! **Leaf hash**: `SHA-256(0x00 || leaf_data)`
//!
//! **Interior node hash**: `SHA-256(0x01 || left || right)`
//!
//! The domain separators keep leaf hashes and interior hashes from ever
//! colliding, so a proof cannot pass an interior node off as a leaf.
//!
//! Inclusion proofs are checked with the bottom-up algorithm of RFC 9162
//! section 2.1.3.2, which handles the right edge of trees whose size is not a
//! power of two without knowing the subtree layout in advance.

use crate::error::AttestError;
use sha2::{Digest, Sha256};

pub const HASH_SIZE: usize = 32;

pub type Hash = [u8; HASH_SIZE];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Recompute the root of a tree of `tree_size` leaves from one leaf and its audit path.
///
/// Fails when the index is out of range or the path length does not fit
/// the tree shape.
pub fn root_from_inclusion_proof(
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &Hash,
    path: &[Hash],
) -> Result<Hash, AttestError> {
    if leaf_index >= tree_size {
        return Err(AttestError::BadInclusion(format!(
            "leaf index {} out of range for tree size {}",
            leaf_index, tree_size
        )));
    }

    let mut fn_ = leaf_index;
    let mut sn = tree_size - 1;
    let mut r = *leaf_hash;

    for p in path {
        if sn == 0 {
            return Err(AttestError::BadInclusion(format!(
                "inclusion path too long ({} hashes) for tree size {}",
                path.len(),
                tree_size
            )));
        }
        if fn_ & 1 == 1 || fn_ == sn {
            r = node_hash(p, &r);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            r = node_hash(&r, p);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        return Err(AttestError::BadInclusion(format!(
            "inclusion path too short ({} hashes) for tree size {}",
            path.len(),
            tree_size
        )));
    }
    Ok(r)
}

/// Check that `leaf_hash` sits at `leaf_index` in the tree with root `root`.
pub fn verify_inclusion(
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &Hash,
    path: &[Hash],
    root: &Hash,
) -> Result<(), AttestError> {
    let computed = root_from_inclusion_proof(leaf_index, tree_size, leaf_hash, path)?;
    if &computed != root {
        return Err(AttestError::BadInclusion(format!(
            "computed root {} does not match root {}",
            hex::encode(computed),
            hex::encode(root)
        )));
    }
    Ok(())
}

/// Root of a tree over leaf hashes, per the RFC 6962 definition.
pub fn tree_root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Sha256::digest(b"").into(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&tree_root(&leaves[..k]), &tree_root(&leaves[k..]))
        }
    }
}

/// Audit path for one leaf, per the RFC 6962 definition.
pub fn inclusion_path(index: usize, leaves: &[Hash]) -> Vec<Hash> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut path = inclusion_path(index, &leaves[..k]);
        path.push(tree_root(&leaves[k..]));
        path
    } else {
        let mut path = inclusion_path(index - k, &leaves[k..]);
        path.push(tree_root(&leaves[..k]));
        path
    }
}

fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}
