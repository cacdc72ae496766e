//! Software-emulated device (development/testing only)
//!
//! Behaves like a device in firmware mode: it reports its UDI, loads one app
//! per session, derives the app key from a device secret and the app digest,
//! and hashes its firmware image on request.
//!
//! # Security Warning
//!
//! **NOT SUITABLE FOR PRODUCTION USE**
//!
//! The device secret lives in process memory. Attesting a software device
//! proves nothing about hardware.

use super::DeviceSession;
use crate::appbins::AppBin;
use crate::error::AttestError;
use crate::hexutil::decode_array;
use crate::secure_file::read_secure;
use crate::udi::Udi;
use ed25519_compact::{KeyPair, Seed};
use sha2::{Digest, Sha512};
use std::fs;
use std::path::Path;

pub struct SoftwareDevice {
    uds: [u8; 32],
    udi: Udi,
    firmware: Vec<u8>,
    app_key: Option<KeyPair>,
    closed: bool,
}

impl SoftwareDevice {
    pub fn new(uds: [u8; 32], udi: Udi, firmware: Vec<u8>) -> Self {
        log::warn!(
            "Using software device {} - NOT SUITABLE FOR PRODUCTION.",
            udi.to_hex()
        );
        SoftwareDevice {
            uds,
            udi,
            firmware,
            app_key: None,
            closed: false,
        }
    }

    /// `uds_file` holds the 32-byte device secret in hex, `firmware_file` the
    /// raw firmware image.
    pub fn from_files(
        uds_file: impl AsRef<Path>,
        udi_hex: &str,
        firmware_file: impl AsRef<Path>,
    ) -> Result<Self, AttestError> {
        let uds_text = read_secure(uds_file.as_ref())?;
        let uds_text = std::str::from_utf8(&uds_text)
            .map_err(|_| AttestError::ParseError("device secret is not text".to_string()))?;
        let uds = decode_array(uds_text.trim(), "device secret")?;
        let udi = Udi::from_hex(udi_hex)?;
        let firmware = fs::read(firmware_file.as_ref())?;
        Ok(Self::new(uds, udi, firmware))
    }

    fn derive_key(&self, app: &AppBin) -> KeyPair {
        let mut h = Sha512::new();
        h.update(self.uds);
        h.update(self.udi.as_bytes());
        h.update(app.hash());
        let digest = h.finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest[..32]);
        KeyPair::from_seed(Seed::new(seed))
    }

    fn check_open(&self) -> Result<(), AttestError> {
        if self.closed {
            return Err(AttestError::DeviceError("device is closed".to_string()));
        }
        Ok(())
    }
}

impl DeviceSession for SoftwareDevice {
    fn udi(&self) -> Udi {
        self.udi
    }

    fn load_app(&mut self, app: &AppBin) -> Result<[u8; 32], AttestError> {
        self.check_open()?;
        if self.app_key.is_some() {
            return Err(AttestError::DeviceError(
                "not in firmware mode, an app is already running".to_string(),
            ));
        }
        let kp = self.derive_key(app);
        let pk = *kp.pk;
        self.app_key = Some(kp);
        log::debug!("Loaded {} on {}", app.tag(), self.udi.to_hex());
        Ok(pk)
    }

    fn sign(&mut self, message: &[u8]) -> Result<[u8; 64], AttestError> {
        self.check_open()?;
        let kp = self
            .app_key
            .as_ref()
            .ok_or_else(|| AttestError::DeviceError("no app loaded".to_string()))?;
        Ok(*kp.sk.sign(message, None))
    }

    fn firmware_digest(&mut self, size: usize) -> Result<[u8; 64], AttestError> {
        self.check_open()?;
        if self.app_key.is_none() {
            return Err(AttestError::DeviceError("no app loaded".to_string()));
        }
        let image = self.firmware.get(..size).ok_or_else(|| {
            AttestError::DeviceError(format!(
                "firmware digest over {} bytes requested, image has {}",
                size,
                self.firmware.len()
            ))
        })?;
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&Sha512::digest(image));
        Ok(digest)
    }

    fn close(&mut self) {
        self.app_key = None;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
