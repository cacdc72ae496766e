//! Device side of the attestation protocol
//!
//! ```text
//! Connected -> AppLoaded -> IdentityChallenged -> FirmwareChecked
//!           -> MessageBuilt -> AttestationObtained -> Persisted
//! ```
//!
//! Every step checks the state it starts from, so the steps cannot be run
//! out of order or twice. Attestation and persistence happen at the vendor
//! through a [`SignEndpoint`]; the relying party stops at `MessageBuilt` and
//! verifies instead.

use crate::appbins::{AppBin, AppHash};
use crate::device::SharedSession;
use crate::error::AttestError;
use crate::firmware::{Firmware, FirmwareRegistry};
use crate::message::{self, Message};
use crate::udi::Udi;
use ed25519_compact::{PublicKey, Signature};
use std::fmt;

pub const CHALLENGE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolState {
    Connected,
    AppLoaded,
    IdentityChallenged,
    FirmwareChecked,
    MessageBuilt,
    AttestationObtained,
    Persisted,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Arguments of a signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignArgs {
    pub udi: Udi,
    pub app_tag: String,
    pub app_hash: AppHash,
    pub message: Message,
}

/// What the vendor stored for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Signature,
    Proof,
    Submission,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Signature => "signature",
            RecordKind::Proof => "proof",
            RecordKind::Submission => "submission",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, AttestError> {
        match s {
            "signature" => Ok(RecordKind::Signature),
            "proof" => Ok(RecordKind::Proof),
            "submission" => Ok(RecordKind::Submission),
            other => Err(AttestError::RpcError(format!("unknown record kind '{}'", other))),
        }
    }
}

/// The vendor side: remote RPC client or an in-process signer.
pub trait SignEndpoint {
    fn ping(&self) -> Result<(), AttestError>;

    /// Obtain an attestation for the message and persist it.
    fn sign(&self, args: &SignArgs) -> Result<RecordKind, AttestError>;
}

pub struct Attestor<'a> {
    session: &'a SharedSession,
    state: ProtocolState,
    udi: Udi,
    app: Option<(String, AppHash)>,
    public_key: Option<[u8; 32]>,
    firmware: Option<Firmware>,
    message: Option<Message>,
}

impl<'a> Attestor<'a> {
    pub fn new(session: &'a SharedSession) -> Result<Self, AttestError> {
        let udi = session.udi()?;
        log::info!("Device UDI: {}", udi);
        Ok(Attestor {
            session,
            state: ProtocolState::Connected,
            udi,
            app: None,
            public_key: None,
            firmware: None,
            message: None,
        })
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn udi(&self) -> &Udi {
        &self.udi
    }

    pub fn public_key(&self) -> Option<&[u8; 32]> {
        self.public_key.as_ref()
    }

    fn expect(&self, step: &'static str, state: ProtocolState) -> Result<(), AttestError> {
        if self.state != state {
            return Err(AttestError::ProtocolOrder {
                step,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, to: ProtocolState) {
        log::debug!("Protocol state {} -> {}", self.state, to);
        self.state = to;
    }

    /// Step 1: load the signer app without a user secret.
    pub fn load_app(&mut self, app: &AppBin) -> Result<[u8; 32], AttestError> {
        self.expect("load app", ProtocolState::Connected)?;
        let pk = self.session.load_app(app)?;
        log::info!("App {} loaded, public key {}", app.tag(), hex::encode(pk));
        self.app = Some((app.tag().to_string(), *app.hash()));
        self.public_key = Some(pk);
        self.advance(ProtocolState::AppLoaded);
        Ok(pk)
    }

    /// Step 2: the device must sign a fresh random challenge with the key it
    /// reported.
    pub fn challenge(&mut self) -> Result<(), AttestError> {
        self.expect("challenge", ProtocolState::AppLoaded)?;
        let pk = self.loaded_key()?;
        let mut challenge = [0u8; CHALLENGE_SIZE];
        getrandom::fill(&mut challenge)
            .map_err(|e| AttestError::InternalError(format!("random challenge: {}", e)))?;
        let signature = self.session.sign(&challenge)?;
        PublicKey::new(pk)
            .verify(challenge, &Signature::new(signature))
            .map_err(|_| AttestError::ChallengeFailed)?;
        self.advance(ProtocolState::IdentityChallenged);
        Ok(())
    }

    /// Step 3: compare the device firmware digest with the expected one.
    pub fn check_firmware(&mut self, firmwares: &FirmwareRegistry) -> Result<Firmware, AttestError> {
        self.expect("check firmware", ProtocolState::IdentityChallenged)?;
        let expected = *firmwares.lookup(&self.udi)?;
        let digest = self.session.firmware_digest(expected.size)?;
        if digest != expected.hash {
            log::error!(
                "Device firmware digest {}… does not match expected {}…",
                hex::encode(&digest[..16]),
                hex::encode(&expected.hash[..16])
            );
            return Err(AttestError::WrongFirmware);
        }
        log::info!(
            "Firmware verified, size:{} hash:{}…",
            expected.size,
            hex::encode(&expected.hash[..16])
        );
        self.firmware = Some(expected);
        self.advance(ProtocolState::FirmwareChecked);
        Ok(expected)
    }

    /// Step 4: build the attested message.
    pub fn build_message(&mut self) -> Result<Message, AttestError> {
        self.expect("build message", ProtocolState::FirmwareChecked)?;
        let pk = self.loaded_key()?;
        let firmware = self
            .firmware
            .as_ref()
            .ok_or_else(|| AttestError::InternalError("firmware not checked".to_string()))?;
        let msg = message::build(self.udi.as_bytes(), &firmware.hash, &pk)?;
        log::debug!("Message: {:?}", msg);
        self.message = Some(msg);
        self.advance(ProtocolState::MessageBuilt);
        Ok(msg)
    }

    /// Steps 5 and 6: have the vendor attest and persist the message.
    pub fn attest(&mut self, endpoint: &dyn SignEndpoint) -> Result<RecordKind, AttestError> {
        self.expect("attest", ProtocolState::MessageBuilt)?;
        let (app_tag, app_hash) = self
            .app
            .clone()
            .ok_or_else(|| AttestError::InternalError("no app loaded".to_string()))?;
        let message = self
            .message
            .ok_or_else(|| AttestError::InternalError("no message built".to_string()))?;
        let kind = endpoint.sign(&SignArgs {
            udi: self.udi,
            app_tag,
            app_hash,
            message,
        })?;
        self.advance(ProtocolState::AttestationObtained);
        log::info!("Vendor stored a {} for {}", kind.as_str(), self.udi.to_hex());
        self.advance(ProtocolState::Persisted);
        Ok(kind)
    }

    fn loaded_key(&self) -> Result<[u8; 32], AttestError> {
        self.public_key
            .ok_or_else(|| AttestError::InternalError("no app loaded".to_string()))
    }

    /// Steps 1 to 4.
    pub fn prepare(&mut self, app: &AppBin, firmwares: &FirmwareRegistry) -> Result<Message, AttestError> {
        self.load_app(app)?;
        self.challenge()?;
        self.check_firmware(firmwares)?;
        self.build_message()
    }
}

/// Run the whole protocol for one device. The device is closed on return,
/// whether the protocol succeeded or not.
pub fn provision(
    session: &SharedSession,
    app: &AppBin,
    firmwares: &FirmwareRegistry,
    endpoint: &dyn SignEndpoint,
) -> Result<RecordKind, AttestError> {
    let _guard = session.guard();
    endpoint.ping()?;
    let mut attestor = Attestor::new(session)?;
    attestor.prepare(app, firmwares)?;
    attestor.attest(endpoint)
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        calls: RefCell<Vec<SignArgs>>,
    }

    impl SignEndpoint for Recorder {
        fn ping(&self) -> Result<(), AttestError> {
            Ok(())
        }

        fn sign(&self, args: &SignArgs) -> Result<RecordKind, AttestError> {
            self.calls.borrow_mut().push(args.clone());
            Ok(RecordKind::Signature)
        }
    }

    fn app() -> AppBin {
        AppBin::new("verisigner-v0.0.3", b"signer".to_vec())
    }

    #[test]
    fn test_provision() {
        let session = session("0133708100000002", 1);
        let udi = session.udi().unwrap();
        let recorder = Recorder {
            calls: RefCell::new(Vec::new()),
        };
        let kind = provision(&session, &app(), &firmwares(&udi), &recorder).unwrap();
        assert_eq!(kind, RecordKind::Signature);
        assert!(session.is_closed());

        let calls = recorder.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].udi, udi);
        assert_eq!(calls[0].app_tag, "verisigner-v0.0.3");
        assert_eq!(calls[0].message.udi(), udi.as_bytes());
    }

    #[test]
    fn test_out_of_order_steps() {
        let session = session("0133708100000002", 1);
        let udi = session.udi().unwrap();
        let mut attestor = Attestor::new(&session).unwrap();
        assert!(matches!(
            attestor.challenge(),
            Err(AttestError::ProtocolOrder { step: "challenge", .. })
        ));
        assert!(attestor.build_message().is_err());
        attestor.load_app(&app()).unwrap();
        assert!(matches!(
            attestor.load_app(&app()),
            Err(AttestError::ProtocolOrder { .. })
        ));
        assert!(attestor.check_firmware(&firmwares(&udi)).is_err());
        attestor.challenge().unwrap();
        assert_eq!(attestor.state(), ProtocolState::IdentityChallenged);
    }

    #[test]
    fn test_wrong_firmware_aborts_and_closes() {
        let session = session("0133708100000002", 1);
        let other = Udi::from_hex("0133708100000002").unwrap();
        let mut registry = FirmwareRegistry::new();
        let hw = other.hardware();
        registry
            .add(&hw.udi0_hex(), hw.vendor_id, hw.product_id, hw.product_rev, FIRMWARE_SIZE, &[0u8; 64])
            .unwrap();
        let recorder = Recorder {
            calls: RefCell::new(Vec::new()),
        };
        let err = provision(&session, &app(), &registry, &recorder).unwrap_err();
        assert!(matches!(err, AttestError::WrongFirmware));
        assert_eq!(err.class(), crate::ErrorClass::VerificationFailed);
        assert!(recorder.calls.borrow().is_empty());
        assert!(session.is_closed());
    }

    #[test]
    fn test_unknown_hardware() {
        let session = session("0010208000000001", 1);
        let registry = FirmwareRegistry::new();
        let mut attestor = Attestor::new(&session).unwrap();
        attestor.load_app(&app()).unwrap();
        attestor.challenge().unwrap();
        assert!(matches!(
            attestor.check_firmware(&registry),
            Err(AttestError::NotFound(_))
        ));
    }
}
