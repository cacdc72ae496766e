//! Registry of device application binaries
//!
//! Binaries are identified by their SHA-512 digest. On disk every
//! `<tag>.bin` comes with a `<tag>.bin.sha512` sidecar holding the digest the
//! release was published with; a binary whose digest does not match its
//! sidecar is never registered.

use crate::error::AttestError;
use crate::hexutil::decode_array;
use regex::Regex;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const APP_HASH_SIZE: usize = 64;

pub type AppHash = [u8; APP_HASH_SIZE];

const BIN_SUFFIX: &str = ".bin";
const SIDECAR_SUFFIX: &str = ".bin.sha512";

/// Signer builds that must not be used any more.
const IGNORED_TAGS: &[&str] = &["verisigner-v0.0.1", "verisigner-v0.0.2"];

const SIGNER_TAG_PATTERN: &str = r"^verisigner-v(\d+)\.(\d+)\.(\d+)$";

#[derive(Clone, PartialEq, Eq)]
pub struct AppBin {
    tag: String,
    bin: Vec<u8>,
    hash: AppHash,
}

impl AppBin {
    pub fn new(tag: impl Into<String>, bin: Vec<u8>) -> Self {
        let mut hash = [0u8; APP_HASH_SIZE];
        hash.copy_from_slice(&Sha512::digest(&bin));
        AppBin {
            tag: tag.into(),
            bin,
            hash,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn bin(&self) -> &[u8] {
        &self.bin
    }

    pub fn hash(&self) -> &AppHash {
        &self.hash
    }
}

impl fmt::Debug for AppBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppBin")
            .field("tag", &self.tag)
            .field("len", &self.bin.len())
            .field("hash", &hex::encode(self.hash))
            .finish()
    }
}

impl fmt::Display for AppBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{} hash:{}…", self.tag, hex::encode(&self.hash[..16]))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    bins: HashMap<AppHash, AppBin>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binary. `expected` is the published digest, if there is one.
    pub fn insert(&mut self, bin: AppBin, expected: Option<&AppHash>) -> Result<(), AttestError> {
        if let Some(expected) = expected {
            if expected != bin.hash() {
                return Err(AttestError::AppDigestMismatch {
                    tag: bin.tag.clone(),
                    expected: hex::encode(expected),
                    computed: hex::encode(bin.hash()),
                });
            }
        }
        if self.bins.contains_key(bin.hash()) {
            return Err(AttestError::AlreadyExists(format!("app binary {}", bin)));
        }
        self.bins.insert(bin.hash, bin);
        Ok(())
    }

    /// Load every `<tag>.bin` with its `<tag>.bin.sha512` sidecar from a directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, AttestError> {
        let dir = dir.as_ref();
        let mut tags = Vec::new();
        let mut sidecars = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(tag) = name.strip_suffix(SIDECAR_SUFFIX) {
                sidecars.push(tag.to_string());
            } else if let Some(tag) = name.strip_suffix(BIN_SUFFIX) {
                tags.push(tag.to_string());
            }
        }

        if let Some(orphan) = sidecars.iter().find(|s| !tags.contains(s)) {
            return Err(AttestError::NotFound(format!(
                "binary for digest file {}{}",
                orphan, SIDECAR_SUFFIX
            )));
        }

        tags.sort();
        let mut registry = Self::new();
        for tag in tags {
            if IGNORED_TAGS.contains(&tag.as_str()) {
                log::debug!("Skipping superseded app {}", tag);
                continue;
            }
            let sidecar = dir.join(format!("{tag}{SIDECAR_SUFFIX}"));
            let text = fs::read_to_string(&sidecar).map_err(|e| {
                AttestError::NotFound(format!("digest file {}: {}", sidecar.display(), e))
            })?;
            let expected_hex = text.split_whitespace().next().unwrap_or_default();
            let expected: AppHash = decode_array(expected_hex, "app digest")?;
            let bin = fs::read(dir.join(format!("{tag}{BIN_SUFFIX}")))?;
            registry.insert(AppBin::new(tag, bin), Some(&expected))?;
        }
        Ok(registry)
    }

    pub fn get(&self, hash: &AppHash) -> Result<&AppBin, AttestError> {
        self.bins
            .get(hash)
            .ok_or_else(|| AttestError::NotFound(format!("app with digest {}", hex::encode(hash))))
    }

    pub fn get_by_tag(&self, tag: &str) -> Result<&AppBin, AttestError> {
        self.bins
            .values()
            .find(|b| b.tag == tag)
            .ok_or_else(|| AttestError::NotFound(format!("app with tag {}", tag)))
    }

    /// Registered app with this digest, which must also carry `tag`.
    pub fn get_tagged(&self, hash: &AppHash, tag: &str) -> Result<&AppBin, AttestError> {
        let bin = self.get(hash)?;
        if bin.tag != tag {
            return Err(AttestError::ParseError(format!(
                "tag {} does not match tag {} of app {}",
                tag,
                bin.tag,
                hex::encode(hash)
            )));
        }
        Ok(bin)
    }

    /// The newest `verisigner-vX.Y.Z` build by numeric version.
    pub fn latest_signer(&self) -> Result<&AppBin, AttestError> {
        let re = Regex::new(SIGNER_TAG_PATTERN)
            .map_err(|e| AttestError::InternalError(e.to_string()))?;
        self.bins
            .values()
            .filter_map(|bin| {
                let caps = re.captures(&bin.tag)?;
                let version: Option<Vec<u64>> =
                    (1..=3).map(|i| caps[i].parse::<u64>().ok()).collect();
                Some((version?, bin))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, bin)| bin)
            .ok_or_else(|| AttestError::NotFound("signer app".to_string()))
    }

    /// Sorted tags of every registered binary.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.bins.values().map(|b| b.tag.clone()).collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}
