//! Signed and cosigned tree heads
//!
//! The log signs a checkpoint naming its own key hash, the tree size and the
//! base64 root hash. Witnesses cosign the same checkpoint prefixed with a
//! namespace line and the time they observed it.

use super::ascii::{parse_u64, write_line, AsciiReader};
use super::leaf::{key_hash, verify_ed25519, KeyHash};
use super::merkle::Hash;
use super::policy::Policy;
use crate::error::AttestError;
use crate::hexutil::decode_array;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashSet;

pub const CHECKPOINT_NAMESPACE: &str = "sigsum.org/v1/tree/";
pub const COSIGNATURE_NAMESPACE: &str = "cosignature/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHead {
    pub size: u64,
    pub root_hash: Hash,
}

impl TreeHead {
    /// The checkpoint text that the log signs.
    pub fn checkpoint(&self, log_key_hash: &KeyHash) -> String {
        format!(
            "{}{}\n{}\n{}\n",
            CHECKPOINT_NAMESPACE,
            hex::encode(log_key_hash),
            self.size,
            STANDARD.encode(self.root_hash)
        )
    }

    /// The text a witness signs when cosigning at `timestamp`.
    pub fn cosigned_data(&self, log_key_hash: &KeyHash, timestamp: u64) -> String {
        format!(
            "{}\ntime {}\n{}",
            COSIGNATURE_NAMESPACE,
            timestamp,
            self.checkpoint(log_key_hash)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cosignature {
    pub key_hash: KeyHash,
    pub timestamp: u64,
    pub signature: [u8; 64],
}

impl Cosignature {
    pub fn verify(&self, witness_key: &[u8; 32], log_key_hash: &KeyHash, head: &TreeHead) -> bool {
        verify_ed25519(
            witness_key,
            head.cosigned_data(log_key_hash, self.timestamp).as_bytes(),
            &self.signature,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosignedTreeHead {
    pub tree_head: TreeHead,
    pub signature: [u8; 64],
    pub cosignatures: Vec<Cosignature>,
}

impl CosignedTreeHead {
    pub(crate) fn read(r: &mut AsciiReader<'_>) -> Result<Self, AttestError> {
        let size = parse_u64(r.value("size")?, "size")?;
        let root_hash = decode_array(r.value("root_hash")?, "root hash")?;
        let signature = decode_array(r.value("signature")?, "tree head signature")?;
        let mut cosignatures = Vec::new();
        while r.peek_key() == Some("cosignature") {
            let v = r.values("cosignature", 3)?;
            cosignatures.push(Cosignature {
                key_hash: decode_array(v[0], "witness key hash")?,
                timestamp: parse_u64(v[1], "cosignature time")?,
                signature: decode_array(v[2], "cosignature")?,
            });
        }
        Ok(CosignedTreeHead {
            tree_head: TreeHead { size, root_hash },
            signature,
            cosignatures,
        })
    }

    pub(crate) fn write(&self, out: &mut String) {
        write_line(out, "size", &[&self.tree_head.size]);
        write_line(out, "root_hash", &[&hex::encode(self.tree_head.root_hash)]);
        write_line(out, "signature", &[&hex::encode(self.signature)]);
        for cosig in &self.cosignatures {
            write_line(
                out,
                "cosignature",
                &[
                    &hex::encode(cosig.key_hash),
                    &cosig.timestamp,
                    &hex::encode(cosig.signature),
                ],
            );
        }
    }

    /// Parse a `get-tree-head` response body.
    pub fn from_ascii(text: &str) -> Result<Self, AttestError> {
        let mut r = AsciiReader::new(text)?;
        let head = Self::read(&mut r)?;
        r.finish()?;
        Ok(head)
    }

    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    /// Check the log signature over the checkpoint.
    pub fn verify_signature(&self, log_key: &[u8; 32]) -> Result<(), AttestError> {
        let checkpoint = self.tree_head.checkpoint(&key_hash(log_key));
        if !verify_ed25519(log_key, checkpoint.as_bytes(), &self.signature) {
            return Err(AttestError::BadTreeHead(
                "log signature does not verify".to_string(),
            ));
        }
        Ok(())
    }

    /// Check cosignatures against the policy witnesses and return the ones
    /// that verified, at most one per witness.
    pub fn verified_cosignatures(&self, log_key_hash: &KeyHash, policy: &Policy) -> Vec<Cosignature> {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for cosig in &self.cosignatures {
            let Some(witness) = policy.witness(&cosig.key_hash) else {
                log::debug!(
                    "Ignoring cosignature by unknown witness {}",
                    hex::encode(cosig.key_hash)
                );
                continue;
            };
            if seen.contains(&cosig.key_hash) {
                continue;
            }
            if !cosig.verify(&witness.public_key, log_key_hash, &self.tree_head) {
                log::warn!("Ignoring invalid cosignature by witness {}", witness.name);
                continue;
            }
            seen.insert(cosig.key_hash);
            accepted.push(*cosig);
        }
        accepted
    }

    /// Verify the log signature and the witness quorum.
    pub fn verify(&self, log_key: &[u8; 32], policy: &Policy) -> Result<Vec<Cosignature>, AttestError> {
        self.verify_signature(log_key)?;
        let accepted = self.verified_cosignatures(&key_hash(log_key), policy);
        let witnesses: HashSet<KeyHash> = accepted.iter().map(|c| c.key_hash).collect();
        if !policy.is_quorum(&witnesses) {
            return Err(AttestError::QuorumNotMet {
                valid: accepted.len(),
            });
        }
        Ok(accepted)
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;

    fn log_key() -> [u8; 32] {
        decode_array(LOG_KEY, "log key").unwrap()
    }

    #[test]
    fn test_checkpoint_format() {
        let head = TreeHead {
            size: 1,
            root_hash: [0u8; 32],
        };
        assert_eq!(
            head.checkpoint(&[0xab; 32]),
            format!(
                "sigsum.org/v1/tree/{}\n1\nAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\n",
                "ab".repeat(32)
            )
        );
        assert!(head
            .cosigned_data(&[0xab; 32], 42)
            .starts_with("cosignature/v1\ntime 42\nsigsum.org/v1/tree/"));
    }

    #[test]
    fn test_fixture_tree_head() {
        let head = CosignedTreeHead::from_ascii(&tree_head_ascii()).unwrap();
        assert_eq!(head.to_ascii(), tree_head_ascii());
        assert_eq!(hex::encode(key_hash(&log_key())), LOG_KEY_HASH);

        let policy = Policy::parse(&policy_text()).unwrap();
        let accepted = head.verify(&log_key(), &policy).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].timestamp, COSIG_TIME);
    }

    #[test]
    fn test_wrong_size_breaks_log_signature() {
        let mut head = CosignedTreeHead::from_ascii(&tree_head_ascii()).unwrap();
        head.tree_head.size += 1;
        let policy = Policy::parse(&policy_text()).unwrap();
        assert!(matches!(
            head.verify(&log_key(), &policy),
            Err(AttestError::BadTreeHead(_))
        ));
    }

    #[test]
    fn test_bad_cosignature_is_ignored() {
        let mut head = CosignedTreeHead::from_ascii(&tree_head_ascii()).unwrap();
        head.cosignatures[0].timestamp += 1;
        let policy = Policy::parse(&policy_text()).unwrap();
        assert!(head.verify_signature(&log_key()).is_ok());
        assert!(head
            .verified_cosignatures(&key_hash(&log_key()), &policy)
            .is_empty());
        assert!(matches!(
            head.verify(&log_key(), &policy),
            Err(AttestError::QuorumNotMet { valid: 0 })
        ));
    }

    #[test]
    fn test_duplicate_cosignature_counts_once() {
        let mut head = CosignedTreeHead::from_ascii(&tree_head_ascii()).unwrap();
        head.cosignatures.push(head.cosignatures[0]);
        let policy = Policy::parse(&policy_text()).unwrap();
        assert_eq!(head.verify(&log_key(), &policy).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(CosignedTreeHead::from_ascii("size=1\n").is_err());
        let extra = format!("{}leaf_index=1\n", tree_head_ascii());
        assert!(CosignedTreeHead::from_ascii(&extra).is_err());
        let short_cosig = format!(
            "size={SIZE}\nroot_hash={ROOT_HASH}\nsignature={SIGNATURE}\ncosignature={WITNESS_KEY_HASH} {COSIG_TIME}\n"
        );
        assert!(CosignedTreeHead::from_ascii(&short_cosig).is_err());
    }
}
