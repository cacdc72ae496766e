//! Relying party verification
//!
//! Fetch the record the vendor published for a device, run the device
//! checks again (app key, challenge, firmware digest), rebuild the message
//! and check the attestation in the record against it.

use crate::appbins::AppRegistry;
use crate::device::SharedSession;
use crate::error::AttestError;
use crate::firmware::FirmwareRegistry;
use crate::protocol::Attestor;
use crate::record::{verification_url, Attestation, VerificationRecord};
use crate::sigsum::SigsumLog;
use crate::transport::HttpTransport;
use crate::udi::Udi;
use crate::vendorkey::VendorKeys;
use std::path::PathBuf;

pub const TILLITIS_VENDOR_ID: u16 = 0x1337;

/// Which attestation a device must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Signature,
    Proof,
    Either,
}

/// Pick the mode from the hardware in the UDI.
pub fn mode_for(udi: &Udi, require_proof: bool) -> Result<VerifyMode, AttestError> {
    let mode = match (udi.vendor_id(), udi.product_id()) {
        (TILLITIS_VENDOR_ID, 2) => VerifyMode::Signature,
        (TILLITIS_VENDOR_ID, 3) => VerifyMode::Proof,
        (TILLITIS_VENDOR_ID, product) => {
            return Err(AttestError::NotFound(format!(
                "verification mode for product {} of vendor 0x{:04x}",
                product, TILLITIS_VENDOR_ID
            )))
        }
        _ if require_proof => VerifyMode::Proof,
        _ => VerifyMode::Either,
    };
    if require_proof && mode == VerifyMode::Signature {
        return Err(AttestError::ConfigError(format!(
            "device {} is attested with vendor signatures, not Sigsum proofs",
            udi.to_hex()
        )));
    }
    Ok(mode)
}

/// Where published records live.
pub enum RecordSource<'a> {
    Dir(PathBuf),
    Url {
        base: String,
        transport: &'a dyn HttpTransport,
    },
}

impl RecordSource<'_> {
    pub fn location(&self, udi: &Udi) -> String {
        match self {
            RecordSource::Dir(dir) => dir.join(udi.to_hex()).display().to_string(),
            RecordSource::Url { base, .. } => verification_url(base, udi),
        }
    }

    pub fn fetch(&self, udi: &Udi) -> Result<VerificationRecord, AttestError> {
        log::debug!("Reading verification record from {}", self.location(udi));
        match self {
            RecordSource::Dir(dir) => VerificationRecord::from_file(dir.join(udi.to_hex())),
            RecordSource::Url { base, transport } => {
                VerificationRecord::from_url(*transport, &verification_url(base, udi))
            }
        }
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct Verified {
    pub udi: Udi,
    pub record: VerificationRecord,
    /// The vendor key or submit key that vouched for the device.
    pub attested_by: String,
}

pub struct Verifier<'a> {
    apps: &'a AppRegistry,
    firmwares: &'a FirmwareRegistry,
    vendor_keys: Option<&'a VendorKeys>,
    sigsum: Option<&'a SigsumLog>,
    require_proof: bool,
}

impl<'a> Verifier<'a> {
    pub fn new(apps: &'a AppRegistry, firmwares: &'a FirmwareRegistry) -> Self {
        Verifier {
            apps,
            firmwares,
            vendor_keys: None,
            sigsum: None,
            require_proof: false,
        }
    }

    pub fn with_vendor_keys(mut self, keys: &'a VendorKeys) -> Self {
        self.vendor_keys = Some(keys);
        self
    }

    pub fn with_sigsum(mut self, log: &'a SigsumLog) -> Self {
        self.sigsum = Some(log);
        self
    }

    /// Refuse vendor signatures for devices where either would do.
    pub fn require_proof(mut self, yes: bool) -> Self {
        self.require_proof = yes;
        self
    }

    /// Verify the device behind `session`. The session is closed on return.
    pub fn verify(&self, session: &SharedSession, source: &RecordSource<'_>) -> Result<Verified, AttestError> {
        let _guard = session.guard();
        let udi = session.udi()?;
        let mode = mode_for(&udi, self.require_proof)?;
        let record = source.fetch(&udi)?;
        match (mode, &record.attestation) {
            (VerifyMode::Signature, Attestation::Proof(_)) => {
                return Err(AttestError::VerificationFailed(
                    "vendor signature required but the record holds a Sigsum proof".to_string(),
                ))
            }
            (VerifyMode::Proof, Attestation::Signature(_)) => {
                return Err(AttestError::VerificationFailed(
                    "Sigsum proof required but not available".to_string(),
                ))
            }
            _ => {}
        }
        log::info!(
            "Record from {}: {} for app {}",
            record.timestamp.to_rfc3339(),
            record.attestation.kind(),
            record.app_tag
        );

        let app = self.apps.get_tagged(&record.app_hash, &record.app_tag)?;
        let mut attestor = Attestor::new(session)?;
        let message = attestor.prepare(app, self.firmwares)?;

        let attested_by = match &record.attestation {
            Attestation::Signature(_) => {
                let keys = self
                    .vendor_keys
                    .ok_or_else(|| AttestError::ConfigError("no vendor keys configured".to_string()))?;
                record.verify_signature(&message, keys)?.to_string()
            }
            Attestation::Proof(_) => {
                let log = self
                    .sigsum
                    .ok_or_else(|| AttestError::ConfigError("no Sigsum keys configured".to_string()))?;
                record.verify_proof(&message, log)?.to_string()
            }
        };
        log::info!("Device {} verified by {}", udi.to_hex(), attested_by);
        Ok(Verified {
            udi,
            record,
            attested_by,
        })
    }
}
