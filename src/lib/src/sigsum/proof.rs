//! Sigsum proofs of logging, ASCII format version 2
//!
//! A proof bundles the short leaf (submit key hash and signature), a
//! cosigned tree head and an inclusion proof for the leaf in that tree.
//! Verification runs leaf, inclusion, tree head and quorum checks in that
//! order and stops at the first failure.

use super::ascii::{parse_u64, write_line, AsciiReader};
use super::leaf::{sha256, KeyHash, Leaf};
use super::merkle::{self, Hash};
use super::policy::Policy;
use super::tree_head::{Cosignature, CosignedTreeHead};
use crate::error::AttestError;
use crate::hexutil::decode_array;
use std::collections::HashMap;

pub const PROOF_VERSION: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortLeaf {
    pub key_hash: KeyHash,
    pub signature: [u8; 64],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InclusionProof {
    pub leaf_index: u64,
    pub node_hashes: Vec<Hash>,
}

impl InclusionProof {
    pub(crate) fn read(r: &mut AsciiReader<'_>) -> Result<Self, AttestError> {
        let leaf_index = parse_u64(r.value("leaf_index")?, "leaf_index")?;
        let mut node_hashes = Vec::new();
        while r.peek_key() == Some("node_hash") {
            node_hashes.push(decode_array(r.value("node_hash")?, "node hash")?);
        }
        Ok(InclusionProof {
            leaf_index,
            node_hashes,
        })
    }

    pub(crate) fn write(&self, out: &mut String) {
        write_line(out, "leaf_index", &[&self.leaf_index]);
        for h in &self.node_hashes {
            write_line(out, "node_hash", &[&hex::encode(h)]);
        }
    }

    /// Parse a `get-inclusion-proof` response body.
    pub fn from_ascii(text: &str) -> Result<Self, AttestError> {
        let mut r = AsciiReader::new(text)?;
        let proof = Self::read(&mut r)?;
        r.finish()?;
        Ok(proof)
    }

    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigsumProof {
    pub log_key_hash: KeyHash,
    pub leaf: ShortLeaf,
    pub tree_head: CosignedTreeHead,
    pub inclusion: InclusionProof,
}

impl SigsumProof {
    pub fn from_ascii(text: &str) -> Result<Self, AttestError> {
        let mut r = AsciiReader::new(text)?;
        let version = parse_u64(r.value("version")?, "version")?;
        if version != PROOF_VERSION {
            return Err(AttestError::ParseError(format!(
                "unsupported proof version {}",
                version
            )));
        }
        let log_key_hash = decode_array(r.value("log")?, "log key hash")?;
        let v = r.values("leaf", 2)?;
        let leaf = ShortLeaf {
            key_hash: decode_array(v[0], "leaf key hash")?,
            signature: decode_array(v[1], "leaf signature")?,
        };
        r.blank()?;
        let tree_head = CosignedTreeHead::read(&mut r)?;
        let inclusion = match tree_head.tree_head.size {
            0 => return Err(AttestError::ParseError("proof for empty tree".to_string())),
            1 => InclusionProof::default(),
            _ => {
                r.blank()?;
                InclusionProof::read(&mut r)?
            }
        };
        r.finish()?;
        Ok(SigsumProof {
            log_key_hash,
            leaf,
            tree_head,
            inclusion,
        })
    }

    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        write_line(&mut out, "version", &[&PROOF_VERSION]);
        write_line(&mut out, "log", &[&hex::encode(self.log_key_hash)]);
        write_line(
            &mut out,
            "leaf",
            &[
                &hex::encode(self.leaf.key_hash),
                &hex::encode(self.leaf.signature),
            ],
        );
        out.push('\n');
        self.tree_head.write(&mut out);
        if self.tree_head.tree_head.size > 1 {
            out.push('\n');
            self.inclusion.write(&mut out);
        }
        out
    }

    /// Verify the proof for the leaf message `digest`, returning the
    /// cosignatures that counted towards the quorum.
    pub fn verify(
        &self,
        digest: &Hash,
        submit_keys: &HashMap<KeyHash, [u8; 32]>,
        policy: &Policy,
    ) -> Result<Vec<Cosignature>, AttestError> {
        let submit_key = submit_keys.get(&self.leaf.key_hash).ok_or_else(|| {
            AttestError::BadLeaf(format!(
                "unknown submit key {}",
                hex::encode(self.leaf.key_hash)
            ))
        })?;
        let leaf = Leaf {
            checksum: sha256(digest),
            signature: self.leaf.signature,
            key_hash: self.leaf.key_hash,
        };
        if !leaf.verify(submit_key) {
            return Err(AttestError::BadLeaf(
                "leaf signature does not verify".to_string(),
            ));
        }

        let head = &self.tree_head.tree_head;
        merkle::verify_inclusion(
            self.inclusion.leaf_index,
            head.size,
            &leaf.hash(),
            &self.inclusion.node_hashes,
            &head.root_hash,
        )?;

        let log = policy.log(&self.log_key_hash).ok_or_else(|| {
            AttestError::BadTreeHead(format!(
                "log {} not in policy",
                hex::encode(self.log_key_hash)
            ))
        })?;
        let accepted = self.tree_head.verify(&log.public_key, policy)?;
        log::debug!(
            "Sigsum proof verified: size {} with {} cosignatures",
            head.size,
            accepted.len()
        );
        Ok(accepted)
    }
}
