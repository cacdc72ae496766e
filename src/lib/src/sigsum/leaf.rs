//! Sigsum leaves and add-leaf requests
//!
//! A submitter signs `"sigsum.org/v1/tree-leaf\0" || SHA-256(message)` with
//! its submit key. The log stores the leaf
//! `checksum (32) || signature (64) || key hash (32)` where the checksum is
//! `SHA-256(message)` and the key hash is `SHA-256(public key)`.

use super::ascii::{write_line, AsciiReader};
use super::merkle::{self, Hash};
use crate::error::AttestError;
use crate::hexutil::decode_array;
use ed25519_compact::{PublicKey, Signature};
use sha2::{Digest, Sha256};

pub type KeyHash = Hash;

pub const TREE_LEAF_NAMESPACE: &[u8] = b"sigsum.org/v1/tree-leaf\0";

pub fn key_hash(public_key: &[u8; 32]) -> KeyHash {
    Sha256::digest(public_key).into()
}

pub(crate) fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

pub(crate) fn verify_ed25519(public_key: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
    PublicKey::new(*public_key)
        .verify(data, &Signature::new(*signature))
        .is_ok()
}

/// The bytes a submitter signs for a leaf with this checksum.
pub fn leaf_signed_data(checksum: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(TREE_LEAF_NAMESPACE.len() + 32);
    data.extend_from_slice(TREE_LEAF_NAMESPACE);
    data.extend_from_slice(checksum);
    data
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub checksum: Hash,
    pub signature: [u8; 64],
    pub key_hash: KeyHash,
}

impl Leaf {
    pub fn to_bytes(&self) -> [u8; 128] {
        let mut b = [0u8; 128];
        b[..32].copy_from_slice(&self.checksum);
        b[32..96].copy_from_slice(&self.signature);
        b[96..].copy_from_slice(&self.key_hash);
        b
    }

    /// Merkle leaf hash of this leaf.
    pub fn hash(&self) -> Hash {
        merkle::leaf_hash(&self.to_bytes())
    }

    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        verify_ed25519(public_key, &leaf_signed_data(&self.checksum), &self.signature)
    }
}

/// An add-leaf request as sent to the log and stored in submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRequest {
    pub message: Hash,
    pub signature: [u8; 64],
    pub public_key: [u8; 32],
}

impl LeafRequest {
    /// What the submit key has to sign for `message`.
    pub fn signed_data(message: &Hash) -> Vec<u8> {
        leaf_signed_data(&sha256(message))
    }

    pub fn from_ascii(text: &str) -> Result<Self, AttestError> {
        let mut r = AsciiReader::new(text)?;
        let message = decode_array(r.value("message")?, "leaf message")?;
        let signature = decode_array(r.value("signature")?, "leaf signature")?;
        let public_key = decode_array(r.value("public_key")?, "submit public key")?;
        r.finish()?;
        Ok(LeafRequest {
            message,
            signature,
            public_key,
        })
    }

    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        write_line(&mut out, "message", &[&hex::encode(self.message)]);
        write_line(&mut out, "signature", &[&hex::encode(self.signature)]);
        write_line(&mut out, "public_key", &[&hex::encode(self.public_key)]);
        out
    }

    pub fn key_hash(&self) -> KeyHash {
        key_hash(&self.public_key)
    }

    pub fn leaf(&self) -> Leaf {
        Leaf {
            checksum: sha256(&self.message),
            signature: self.signature,
            key_hash: self.key_hash(),
        }
    }

    /// Check the submitter signature, returning the submit key hash.
    pub fn verify(&self) -> Result<KeyHash, AttestError> {
        if !self.leaf().verify(&self.public_key) {
            return Err(AttestError::BadLeaf(
                "leaf request signature does not verify".to_string(),
            ));
        }
        Ok(self.key_hash())
    }
}
