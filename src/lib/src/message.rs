//! The attested message
//!
//! `UDI (8, big-endian) || firmware SHA-512 (64) || app public key (32)`

use crate::error::AttestError;
use crate::firmware::FW_HASH_SIZE;
use crate::udi::UDI_SIZE;
use crate::vendorkey::PUBLIC_KEY_SIZE;
use sha2::{Digest, Sha256};
use std::fmt;

pub const MESSAGE_SIZE: usize = UDI_SIZE + FW_HASH_SIZE + PUBLIC_KEY_SIZE;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Message([u8; MESSAGE_SIZE]);

impl Message {
    /// Wrap bytes received from elsewhere, such as a signing request.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AttestError> {
        let bytes: [u8; MESSAGE_SIZE] = bytes.try_into().map_err(|_| AttestError::WrongLength {
            what: "message",
            expected: MESSAGE_SIZE,
            got: bytes.len(),
        })?;
        Ok(Message(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_SIZE] {
        &self.0
    }

    pub fn udi(&self) -> &[u8] {
        &self.0[..UDI_SIZE]
    }

    pub fn public_key(&self) -> &[u8] {
        &self.0[UDI_SIZE + FW_HASH_SIZE..]
    }

    /// SHA-256 of the message, the value submitted as a transparency log leaf.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({})", hex::encode(self.0))
    }
}

fn check(what: &'static str, bytes: &[u8], expected: usize) -> Result<(), AttestError> {
    if bytes.len() != expected {
        return Err(AttestError::WrongLength {
            what,
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

/// Build the message, checking each component length on its own.
pub fn build(udi: &[u8], firmware_hash: &[u8], app_public_key: &[u8]) -> Result<Message, AttestError> {
    check("UDI", udi, UDI_SIZE)?;
    check("firmware hash", firmware_hash, FW_HASH_SIZE)?;
    check("app public key", app_public_key, PUBLIC_KEY_SIZE)?;

    let mut msg = [0u8; MESSAGE_SIZE];
    msg[..UDI_SIZE].copy_from_slice(udi);
    msg[UDI_SIZE..UDI_SIZE + FW_HASH_SIZE].copy_from_slice(firmware_hash);
    msg[UDI_SIZE + FW_HASH_SIZE..].copy_from_slice(app_public_key);
    Ok(Message(msg))
}
