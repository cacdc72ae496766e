//! Vendor signing keys
//!
//! Each line of a vendor key file is
//! `<ed25519 public key hex> <app tag> <app digest hex>`: the key and the
//! signer app build that holds it. Several keys may be listed so that
//! attestations made before a key rotation keep verifying.

use crate::appbins::{AppHash, AppRegistry};
use crate::error::AttestError;
use crate::hexutil::decode_array;
use ed25519_compact::{PublicKey, Signature};
use std::collections::BTreeMap;
use std::fmt;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Clone, PartialEq, Eq)]
pub struct VendorKey {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub tag: String,
    pub app_hash: AppHash,
}

impl VendorKey {
    /// Check an ed25519 signature made by this key.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
        let pk = PublicKey::new(self.public_key);
        pk.verify(message, &Signature::new(*signature)).is_ok()
    }
}

impl fmt::Debug for VendorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VendorKey({})", self)
    }
}

impl fmt::Display for VendorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pubkey:{} tag:{} apphash:{}…",
            hex::encode(self.public_key),
            self.tag,
            hex::encode(&self.app_hash[..16])
        )
    }
}

/// Vendor keys keyed by the hex digest of the app that holds them.
#[derive(Debug, Clone, Default)]
pub struct VendorKeys {
    keys: BTreeMap<String, VendorKey>,
}

impl VendorKeys {
    pub fn parse(text: &str, apps: &AppRegistry) -> Result<Self, AttestError> {
        let mut store = VendorKeys::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(AttestError::ParseError(format!(
                    "vendor key line {}: expected 3 fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let public_key = decode_array(fields[0], "vendor public key")?;
            let app_hash: AppHash = decode_array(fields[2], "app digest")?;
            apps.get_tagged(&app_hash, fields[1])?;
            store.insert(VendorKey {
                public_key,
                tag: fields[1].to_string(),
                app_hash,
            })?;
        }
        Ok(store)
    }

    pub fn insert(&mut self, key: VendorKey) -> Result<(), AttestError> {
        if self.keys.values().any(|k| k.public_key == key.public_key) {
            return Err(AttestError::AlreadyExists(format!(
                "vendor public key {}",
                hex::encode(key.public_key)
            )));
        }
        let id = hex::encode(key.app_hash);
        if self.keys.contains_key(&id) {
            return Err(AttestError::AlreadyExists(format!(
                "vendor key for app digest {}",
                id
            )));
        }
        self.keys.insert(id, key);
        Ok(())
    }

    pub fn get(&self, app_hash: &AppHash) -> Result<&VendorKey, AttestError> {
        self.keys.get(&hex::encode(app_hash)).ok_or_else(|| {
            AttestError::NotFound(format!("vendor key for app {}", hex::encode(app_hash)))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &VendorKey> {
        self.keys.values()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Accept the signature if any known vendor key made it.
    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<&VendorKey, AttestError> {
        self.keys
            .values()
            .find(|key| key.verify(message, signature))
            .ok_or_else(|| AttestError::VerificationFailed("vendor signature not verified".to_string()))
    }
}
