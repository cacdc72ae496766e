//! Verification records and Sigsum submissions
//!
//! Both are small JSON documents named after the device UDI. A verification
//! record carries exactly one attestation: a vendor signature or a Sigsum
//! proof. A submission carries a signed leaf request waiting to be logged.

use crate::appbins::AppHash;
use crate::error::AttestError;
use crate::hexutil::decode_array;
use crate::message::Message;
use crate::secure_file::write_new_secure;
use crate::sigsum::{LeafRequest, SigsumLog, SigsumProof, SubmitKey};
use crate::time::{format_rfc3339, parse_rfc3339};
use crate::transport::HttpTransport;
use crate::udi::Udi;
use crate::vendorkey::{VendorKey, VendorKeys, SIGNATURE_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attestation {
    Signature([u8; SIGNATURE_SIZE]),
    Proof(SigsumProof),
}

impl Attestation {
    pub fn kind(&self) -> &'static str {
        match self {
            Attestation::Signature(_) => "vendor signature",
            Attestation::Proof(_) => "Sigsum proof",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct VerificationJson {
    timestamp: String,
    apptag: String,
    apphash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proof: Option<String>,
}

fn check_tag(tag: &str) -> Result<(), AttestError> {
    if tag.is_empty() {
        return Err(AttestError::ParseError("app tag is empty".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    pub timestamp: DateTime<Utc>,
    pub app_tag: String,
    pub app_hash: AppHash,
    pub attestation: Attestation,
}

impl VerificationRecord {
    pub fn from_json(json: &[u8]) -> Result<Self, AttestError> {
        let v: VerificationJson = serde_json::from_slice(json)?;
        check_tag(&v.apptag)?;
        let attestation = match (v.signature, v.proof) {
            (Some(_), Some(_)) => {
                return Err(AttestError::ParseError(
                    "record contains both a vendor signature and a Sigsum proof".to_string(),
                ))
            }
            (None, None) => {
                return Err(AttestError::ParseError(
                    "record contains neither a vendor signature nor a Sigsum proof".to_string(),
                ))
            }
            (Some(sig), None) => Attestation::Signature(decode_array(&sig, "vendor signature")?),
            (None, Some(proof)) => Attestation::Proof(SigsumProof::from_ascii(&proof)?),
        };
        Ok(VerificationRecord {
            timestamp: parse_rfc3339(&v.timestamp)?,
            app_tag: v.apptag,
            app_hash: decode_array(&v.apphash, "app digest")?,
            attestation,
        })
    }

    /// Compact JSON followed by a newline.
    pub fn to_json(&self) -> Result<Vec<u8>, AttestError> {
        check_tag(&self.app_tag)?;
        let (signature, proof) = match &self.attestation {
            Attestation::Signature(sig) => (Some(hex::encode(sig)), None),
            Attestation::Proof(proof) => (None, Some(proof.to_ascii())),
        };
        let mut json = serde_json::to_vec(&VerificationJson {
            timestamp: format_rfc3339(&self.timestamp),
            apptag: self.app_tag.clone(),
            apphash: hex::encode(self.app_hash),
            signature,
            proof,
        })?;
        json.push(b'\n');
        Ok(json)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AttestError> {
        let path = path.as_ref();
        let json = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AttestError::NotFound(path.display().to_string()),
            _ => AttestError::IOError(e),
        })?;
        Self::from_json(&json)
    }

    /// Write with create-new semantics and mode 0600.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), AttestError> {
        write_new_secure(path.as_ref(), &self.to_json()?)
    }

    pub fn from_url(transport: &dyn HttpTransport, url: &str) -> Result<Self, AttestError> {
        let response = transport.get(url)?;
        match response.status {
            200 => Self::from_json(&response.body),
            404 => Err(AttestError::NotFound(url.to_string())),
            status => Err(AttestError::NetworkError(format!(
                "fetching {} returned status {}",
                url, status
            ))),
        }
    }

    /// Check a vendor signature record against the message.
    pub fn verify_signature<'a>(
        &self,
        message: &Message,
        vendor_keys: &'a VendorKeys,
    ) -> Result<&'a VendorKey, AttestError> {
        match &self.attestation {
            Attestation::Signature(sig) => vendor_keys.verify_signature(message.as_bytes(), sig),
            Attestation::Proof(_) => Err(AttestError::VerificationFailed(
                "expected a vendor signature but got a Sigsum proof".to_string(),
            )),
        }
    }

    /// Check a Sigsum proof record against the message.
    pub fn verify_proof<'a>(
        &self,
        message: &Message,
        log: &'a SigsumLog,
    ) -> Result<&'a SubmitKey, AttestError> {
        match &self.attestation {
            Attestation::Proof(proof) => {
                let key = log.verify_message(proof, message)?;
                key.check_app(&self.app_tag, &self.app_hash)?;
                Ok(key)
            }
            Attestation::Signature(_) => Err(AttestError::VerificationFailed(
                "Sigsum proof required but not available".to_string(),
            )),
        }
    }
}

/// Where the record of a device is published under `base_url`.
pub fn verification_url(base_url: &str, udi: &Udi) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), udi.to_hex())
}

#[derive(Serialize, Deserialize)]
struct SubmissionJson {
    timestamp: String,
    apptag: String,
    apphash: String,
    request: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub timestamp: DateTime<Utc>,
    pub app_tag: String,
    pub app_hash: AppHash,
    pub request: LeafRequest,
}

impl Submission {
    /// Parse and check the request signature.
    pub fn from_json(json: &[u8]) -> Result<Self, AttestError> {
        let s: SubmissionJson = serde_json::from_slice(json)?;
        check_tag(&s.apptag)?;
        let request = LeafRequest::from_ascii(&s.request)?;
        request.verify()?;
        Ok(Submission {
            timestamp: parse_rfc3339(&s.timestamp)?,
            app_tag: s.apptag,
            app_hash: decode_array(&s.apphash, "app digest")?,
            request,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, AttestError> {
        check_tag(&self.app_tag)?;
        let mut json = serde_json::to_vec(&SubmissionJson {
            timestamp: format_rfc3339(&self.timestamp),
            apptag: self.app_tag.clone(),
            apphash: hex::encode(self.app_hash),
            request: self.request.to_ascii(),
        })?;
        json.push(b'\n');
        Ok(json)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AttestError> {
        Self::from_json(&fs::read(path)?)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), AttestError> {
        write_new_secure(path.as_ref(), &self.to_json()?)
    }

    /// The verification record for this submission once it is logged.
    pub fn into_record(self, proof: SigsumProof) -> VerificationRecord {
        VerificationRecord {
            timestamp: self.timestamp,
            app_tag: self.app_tag,
            app_hash: self.app_hash,
            attestation: Attestation::Proof(proof),
        }
    }
}
