//! Vendor side of the attestation protocol
//!
//! The [`SignerService`] receives signing requests, obtains an attestation
//! from its [`Authority`] and persists it under the device UDI. Requests are
//! serialized through one lock so a device can never end up with two
//! records.

use crate::appbins::{AppBin, AppRegistry};
use crate::device::SharedSession;
use crate::error::AttestError;
use crate::hexutil::decode_array;
use crate::protocol::{RecordKind, SignArgs, SignEndpoint};
use crate::record::{Attestation, Submission, VerificationRecord};
use crate::secure_file::read_secure;
use crate::sigsum::{LeafRequest, LogClient, SigsumLog};
use crate::time::TimeSource;
use crate::transport::HttpTransport;
use crate::udi::Udi;
use chrono::{DateTime, Utc};
use ed25519_compact::{KeyPair, PublicKey, Seed, Signature};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Something that holds an ed25519 key and signs with it.
pub trait MessageSigner: Send {
    fn public_key(&self) -> [u8; 32];
    fn sign(&self, message: &[u8]) -> Result<[u8; 64], AttestError>;
}

/// A key held by a device running the signer app.
pub struct DeviceSigner {
    session: SharedSession,
    public_key: [u8; 32],
}

impl DeviceSigner {
    /// Load `app` on the device and check that it holds `expected`.
    pub fn open(session: SharedSession, app: &AppBin, expected: &[u8; 32]) -> Result<Self, AttestError> {
        let public_key = session.load_app(app)?;
        if &public_key != expected {
            session.close();
            return Err(AttestError::VerificationFailed(format!(
                "signing device holds key {}, expected {}",
                hex::encode(public_key),
                hex::encode(expected)
            )));
        }
        log::info!(
            "Found signing device {} with the expected public key",
            session.udi()?.to_hex()
        );
        Ok(DeviceSigner {
            session,
            public_key,
        })
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

impl MessageSigner for DeviceSigner {
    fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    fn sign(&self, message: &[u8]) -> Result<[u8; 64], AttestError> {
        self.session.sign(message)
    }
}

/// An in-memory key, for development setups without a signing device.
pub struct KeySigner {
    key_pair: KeyPair,
}

impl KeySigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        KeySigner {
            key_pair: KeyPair::from_seed(Seed::new(seed)),
        }
    }

    /// Read a hex encoded 32-byte seed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AttestError> {
        let text = read_secure(path.as_ref())?;
        let text = std::str::from_utf8(&text)
            .map_err(|_| AttestError::ParseError("signing key is not text".to_string()))?;
        Ok(Self::from_seed(decode_array(text.trim(), "signing key seed")?))
    }
}

impl MessageSigner for KeySigner {
    fn public_key(&self) -> [u8; 32] {
        *self.key_pair.pk
    }

    fn sign(&self, message: &[u8]) -> Result<[u8; 64], AttestError> {
        Ok(*self.key_pair.sk.sign(message, None))
    }
}

/// A record ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Verification(VerificationRecord),
    Submission(Submission),
}

impl StoredRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            StoredRecord::Verification(v) => match v.attestation {
                Attestation::Signature(_) => RecordKind::Signature,
                Attestation::Proof(_) => RecordKind::Proof,
            },
            StoredRecord::Submission(_) => RecordKind::Submission,
        }
    }
}

pub trait Authority: Send {
    fn attest(&self, args: &SignArgs, timestamp: DateTime<Utc>) -> Result<StoredRecord, AttestError>;
}

/// Signs the message with the vendor key.
pub struct VendorAuthority {
    signer: Box<dyn MessageSigner>,
}

impl VendorAuthority {
    pub fn new(signer: Box<dyn MessageSigner>) -> Self {
        VendorAuthority { signer }
    }
}

impl Authority for VendorAuthority {
    fn attest(&self, args: &SignArgs, timestamp: DateTime<Utc>) -> Result<StoredRecord, AttestError> {
        let signature = self.signer.sign(args.message.as_bytes())?;
        PublicKey::new(self.signer.public_key())
            .verify(args.message.as_bytes(), &Signature::new(signature))
            .map_err(|_| {
                AttestError::VerificationFailed("vendor signature failed verification".to_string())
            })?;
        Ok(StoredRecord::Verification(VerificationRecord {
            timestamp,
            app_tag: args.app_tag.clone(),
            app_hash: args.app_hash,
            attestation: Attestation::Signature(signature),
        }))
    }
}

/// Logs the message digest in a Sigsum log.
pub struct SigsumAuthority {
    signer: Box<dyn MessageSigner>,
    log: SigsumLog,
    transport: Box<dyn HttpTransport>,
    log_url: Option<String>,
    poll_interval: Duration,
    max_attempts: u32,
    deferred: bool,
}

impl SigsumAuthority {
    /// `deferred` authorities only write submissions for the batch processor.
    pub fn new(
        signer: Box<dyn MessageSigner>,
        log: SigsumLog,
        transport: Box<dyn HttpTransport>,
        deferred: bool,
    ) -> Result<Self, AttestError> {
        let kh = crate::sigsum::key_hash(&signer.public_key());
        let key = log.submit_key(&kh).ok_or_else(|| {
            AttestError::ConfigError(format!(
                "signing key {} is not a known submit key",
                hex::encode(signer.public_key())
            ))
        })?;
        log::info!("Sigsum submit key: {}", key);
        Ok(SigsumAuthority {
            signer,
            log,
            transport,
            log_url: None,
            poll_interval: crate::sigsum::client::DEFAULT_POLL_INTERVAL,
            max_attempts: crate::sigsum::client::DEFAULT_MAX_ATTEMPTS,
            deferred,
        })
    }

    pub fn with_log_url(mut self, url: Option<String>) -> Self {
        self.log_url = url;
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts;
        self
    }

    fn leaf_request(&self, args: &SignArgs) -> Result<LeafRequest, AttestError> {
        let message = args.message.digest();
        let request = LeafRequest {
            message,
            signature: self.signer.sign(&LeafRequest::signed_data(&message))?,
            public_key: self.signer.public_key(),
        };
        request.verify()?;
        Ok(request)
    }
}

impl Authority for SigsumAuthority {
    fn attest(&self, args: &SignArgs, timestamp: DateTime<Utc>) -> Result<StoredRecord, AttestError> {
        let kh = crate::sigsum::key_hash(&self.signer.public_key());
        self.log
            .submit_key(&kh)
            .ok_or_else(|| AttestError::InternalError("submit key left the key store".to_string()))?
            .check_app(&args.app_tag, &args.app_hash)?;
        let request = self.leaf_request(args)?;
        let submission = Submission {
            timestamp,
            app_tag: args.app_tag.clone(),
            app_hash: args.app_hash,
            request,
        };
        if self.deferred {
            return Ok(StoredRecord::Submission(submission));
        }
        let log_entry = self
            .log
            .policy()
            .logs()
            .first()
            .ok_or_else(|| AttestError::ConfigError("policy has no log".to_string()))?;
        let client = LogClient::new(self.transport.as_ref(), log_entry, self.log_url.as_deref())?
            .with_polling(self.poll_interval, self.max_attempts);
        let proof = client.submit(&submission.request)?;
        self.log.verify_proof(&proof, &request.message)?;
        Ok(StoredRecord::Verification(submission.into_record(proof)))
    }
}

/// Where records are written, one file per UDI.
#[derive(Debug, Clone)]
pub struct RecordStore {
    signatures_dir: PathBuf,
    submissions_dir: PathBuf,
}

impl RecordStore {
    pub fn new(signatures_dir: impl Into<PathBuf>, submissions_dir: impl Into<PathBuf>) -> Self {
        RecordStore {
            signatures_dir: signatures_dir.into(),
            submissions_dir: submissions_dir.into(),
        }
    }

    pub fn create_dirs(&self) -> Result<(), AttestError> {
        fs::create_dir_all(&self.signatures_dir)?;
        fs::create_dir_all(&self.submissions_dir)?;
        Ok(())
    }

    pub fn path_for(&self, kind: RecordKind, udi: &Udi) -> PathBuf {
        let dir = match kind {
            RecordKind::Submission => &self.submissions_dir,
            RecordKind::Signature | RecordKind::Proof => &self.signatures_dir,
        };
        dir.join(udi.to_hex())
    }

    /// An existing record or submission for the device.
    pub fn existing(&self, udi: &Udi) -> Option<PathBuf> {
        [RecordKind::Signature, RecordKind::Submission]
            .into_iter()
            .map(|kind| self.path_for(kind, udi))
            .find(|path| path.exists())
    }

    pub fn persist(&self, udi: &Udi, record: &StoredRecord) -> Result<PathBuf, AttestError> {
        let path = self.path_for(record.kind(), udi);
        match record {
            StoredRecord::Verification(v) => v.to_file(&path)?,
            StoredRecord::Submission(s) => s.to_file(&path)?,
        }
        Ok(path)
    }
}

struct SignerState {
    authority: Box<dyn Authority>,
    store: RecordStore,
}

pub struct SignerService {
    state: Mutex<SignerState>,
    apps: Option<AppRegistry>,
    time: Box<dyn TimeSource>,
}

impl SignerService {
    pub fn new(authority: Box<dyn Authority>, store: RecordStore, time: Box<dyn TimeSource>) -> Self {
        SignerService {
            state: Mutex::new(SignerState { authority, store }),
            apps: None,
            time,
        }
    }

    /// Only accept requests for apps in this registry.
    pub fn with_apps(mut self, apps: AppRegistry) -> Self {
        self.apps = Some(apps);
        self
    }

    fn check_args(&self, args: &SignArgs) -> Result<(), AttestError> {
        if args.app_tag.is_empty() {
            return Err(AttestError::ParseError("empty app tag".to_string()));
        }
        if args.message.udi() != args.udi.as_bytes() {
            return Err(AttestError::ParseError(
                "message does not start with the device UDI".to_string(),
            ));
        }
        if let Some(apps) = &self.apps {
            apps.get_tagged(&args.app_hash, &args.app_tag)?;
        }
        Ok(())
    }
}

impl SignEndpoint for SignerService {
    fn ping(&self) -> Result<(), AttestError> {
        Ok(())
    }

    fn sign(&self, args: &SignArgs) -> Result<RecordKind, AttestError> {
        let state = self
            .state
            .lock()
            .map_err(|e| AttestError::InternalError(format!("Lock poisoned: {}", e)))?;
        log::info!(
            "Signing for device {} (tag: {})",
            args.udi.to_hex(),
            args.app_tag
        );
        self.check_args(args)?;
        if let Some(path) = state.store.existing(&args.udi) {
            return Err(AttestError::AlreadyExists(path.display().to_string()));
        }
        let timestamp = self.time.now()?;
        let record = state.authority.attest(args, timestamp)?;
        let path = state.store.persist(&args.udi, &record)?;
        log::info!("Wrote {}", path.display());
        Ok(record.kind())
    }
}
