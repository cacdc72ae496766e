//! Sigsum submit keys and their validity windows
//!
//! A submit key file holds one record per key, records separated by empty
//! lines:
//!
//! ```text
//! <name>
//! ssh-ed25519 <base64> [comment]
//! <app tag>
//! <app digest hex>
//! [<validity start, RFC 3339>
//!  <validity end, RFC 3339>]
//! ```

use super::leaf::{key_hash, KeyHash};
use super::merkle::Hash;
use super::policy::Policy;
use super::proof::SigsumProof;
use crate::appbins::{AppHash, AppRegistry};
use crate::error::AttestError;
use crate::hexutil::decode_array;
use crate::message::Message;
use crate::time::{format_rfc3339, from_unix, parse_rfc3339};
use chrono::{DateTime, Utc};
use ssh_keys::openssh;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Validity {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AttestError> {
        if start >= end {
            return Err(AttestError::ParseError(format!(
                "validity start {} is not before end {}",
                format_rfc3339(&start),
                format_rfc3339(&end)
            )));
        }
        Ok(Validity { start, end })
    }

    /// Start inclusive, end exclusive.
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        &self.start <= t && t < &self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitKey {
    pub name: String,
    pub public_key: [u8; 32],
    pub tag: String,
    pub app_hash: AppHash,
    pub validity: Option<Validity>,
}

impl SubmitKey {
    pub fn key_hash(&self) -> KeyHash {
        key_hash(&self.public_key)
    }

    /// A submit key only vouches for the one app build it was issued for.
    pub fn check_app(&self, tag: &str, app_hash: &AppHash) -> Result<(), AttestError> {
        if self.tag != tag || &self.app_hash != app_hash {
            return Err(AttestError::SubmitKeyApp {
                app: format!("{} ({})", tag, hex::encode(&app_hash[..8])),
                key: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SubmitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} using app {}: {}",
            self.name,
            self.tag,
            hex::encode(self.public_key)
        )?;
        if let Some(v) = &self.validity {
            write!(f, " valid {} - {}", format_rfc3339(&v.start), format_rfc3339(&v.end))?;
        }
        Ok(())
    }
}

/// Parse an OpenSSH `ssh-ed25519` public key line.
pub fn parse_ssh_ed25519(line: &str) -> Result<[u8; 32], AttestError> {
    match openssh::parse_public_key(line.trim()) {
        Ok(ssh_keys::PublicKey::Ed25519(raw)) => Ok(raw),
        Ok(_) => Err(AttestError::ParseError(
            "submit key is not an ssh-ed25519 key".to_string(),
        )),
        Err(e) => Err(AttestError::ParseError(format!(
            "invalid OpenSSH public key: {}",
            e
        ))),
    }
}

pub fn parse_submit_keys(text: &str, apps: &AppRegistry) -> Result<Vec<SubmitKey>, AttestError> {
    let mut blocks: Vec<Vec<&str>> = vec![Vec::new()];
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if line.is_empty() {
            if blocks.last().is_some_and(|b| !b.is_empty()) {
                blocks.push(Vec::new());
            }
            continue;
        }
        if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    let mut keys: Vec<SubmitKey> = Vec::new();
    for block in blocks.into_iter().filter(|b| !b.is_empty()) {
        if block.len() != 4 && block.len() != 6 {
            return Err(AttestError::ParseError(format!(
                "submit key '{}': expected 4 or 6 lines, got {}",
                block[0],
                block.len()
            )));
        }
        let public_key = parse_ssh_ed25519(block[1])?;
        let app_hash: AppHash = decode_array(block[3], "submit key app digest")?;
        apps.get_tagged(&app_hash, block[2])?;
        let validity = if block.len() == 6 {
            Some(Validity::new(
                parse_rfc3339(block[4])?,
                parse_rfc3339(block[5])?,
            )?)
        } else {
            None
        };
        if keys.iter().any(|k| k.public_key == public_key) {
            return Err(AttestError::AlreadyExists(format!(
                "submit public key {}",
                hex::encode(public_key)
            )));
        }
        keys.push(SubmitKey {
            name: block[0].to_string(),
            public_key,
            tag: block[2].to_string(),
            app_hash,
            validity,
        });
    }
    Ok(keys)
}

/// Submit keys plus the trust policy, everything needed to verify proofs.
#[derive(Debug, Clone)]
pub struct SigsumLog {
    keys: BTreeMap<KeyHash, SubmitKey>,
    submit_keys: HashMap<KeyHash, [u8; 32]>,
    policy: Policy,
}

impl SigsumLog {
    pub fn new(keys: Vec<SubmitKey>, policy: Policy) -> Result<Self, AttestError> {
        let mut by_hash = BTreeMap::new();
        for key in keys {
            let kh = key.key_hash();
            if by_hash.insert(kh, key).is_some() {
                return Err(AttestError::AlreadyExists(format!(
                    "submit key hash {}",
                    hex::encode(kh)
                )));
            }
        }
        let submit_keys = by_hash
            .iter()
            .map(|(kh, k)| (*kh, k.public_key))
            .collect();
        Ok(SigsumLog {
            keys: by_hash,
            submit_keys,
            policy,
        })
    }

    pub fn parse(keys: &str, policy: &str, apps: &AppRegistry) -> Result<Self, AttestError> {
        Self::new(parse_submit_keys(keys, apps)?, Policy::parse(policy)?)
    }

    pub fn submit_keys(&self) -> &HashMap<KeyHash, [u8; 32]> {
        &self.submit_keys
    }

    pub fn submit_key(&self, key_hash: &KeyHash) -> Option<&SubmitKey> {
        self.keys.get(key_hash)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SubmitKey> {
        self.keys.values()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Verify a proof for the leaf message `digest` and check the accepted
    /// cosignature times against the submit key validity window.
    pub fn verify_proof(&self, proof: &SigsumProof, digest: &Hash) -> Result<&SubmitKey, AttestError> {
        let accepted = proof.verify(digest, &self.submit_keys, &self.policy)?;
        let key = self.submit_key(&proof.leaf.key_hash).ok_or_else(|| {
            AttestError::BadLeaf(format!(
                "unknown submit key {}",
                hex::encode(proof.leaf.key_hash)
            ))
        })?;
        if let Some(validity) = &key.validity {
            for cosig in &accepted {
                let t = from_unix(cosig.timestamp)?;
                if !validity.contains(&t) {
                    return Err(AttestError::OutsideValidityWindow {
                        timestamp: format_rfc3339(&t),
                        start: format_rfc3339(&validity.start),
                        end: format_rfc3339(&validity.end),
                    });
                }
            }
        }
        log::debug!("Proof signed by submit key {}", key.name);
        Ok(key)
    }

    /// Verify a proof over an attested message.
    pub fn verify_message(&self, proof: &SigsumProof, message: &Message) -> Result<&SubmitKey, AttestError> {
        self.verify_proof(proof, &message.digest())
    }
}
