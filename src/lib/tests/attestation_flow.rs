//! Provision devices and verify them again the way a relying party would.

use devattest::appbins::{AppBin, AppRegistry};
use devattest::batch::{process_submissions, BatchDirs};
use devattest::device::{SharedSession, SoftwareDevice};
use devattest::firmware::FirmwareRegistry;
use devattest::protocol::{provision, RecordKind};
use devattest::signer::{KeySigner, MessageSigner, RecordStore, SigsumAuthority, SignerService, VendorAuthority};
use devattest::sigsum::merkle::{inclusion_path, tree_root};
use devattest::sigsum::{
    key_hash, Cosignature, CosignedTreeHead, Hash, InclusionProof, LeafRequest, LogClient, Policy, SigsumLog,
    SubmitKey, TreeHead,
};
use devattest::time::FixedTimeSource;
use devattest::transport::{HttpResponse, HttpTransport};
use devattest::udi::Udi;
use devattest::vendorkey::{VendorKey, VendorKeys};
use devattest::verify::{RecordSource, Verifier};
use devattest::AttestError;
use ed25519_compact::{KeyPair, Seed};
use sha2::{Digest, Sha512};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const FIRMWARE_SIZE: usize = 4096;
const SIGNED_AT: i64 = 1_756_811_232;
const COSIGNED_AT: u64 = 1_756_811_283;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("devattest_flow_{}_{}", std::process::id(), name));
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn firmware_image() -> Vec<u8> {
    (0..5000u32).map(|i| (i % 251) as u8).collect()
}

fn device(udi: &str, uds: u8) -> SharedSession {
    SharedSession::new(SoftwareDevice::new(
        [uds; 32],
        Udi::from_hex(udi).unwrap(),
        firmware_image(),
    ))
}

fn firmwares(udi: &str, image: &[u8]) -> FirmwareRegistry {
    let hw = Udi::from_hex(udi).unwrap().hardware();
    let mut registry = FirmwareRegistry::new();
    registry
        .add(
            &hw.udi0_hex(),
            hw.vendor_id,
            hw.product_id,
            hw.product_rev,
            FIRMWARE_SIZE,
            &Sha512::digest(&image[..FIRMWARE_SIZE]),
        )
        .unwrap();
    registry
}

fn signer_app() -> (AppBin, AppRegistry) {
    let app = AppBin::new("verisigner-v0.0.3", b"device signer app".to_vec());
    let mut apps = AppRegistry::new();
    apps.insert(app.clone(), None).unwrap();
    (app, apps)
}

fn time() -> Box<FixedTimeSource> {
    Box::new(FixedTimeSource::from_unix_secs(SIGNED_AT).unwrap())
}

/// Serves published records from a directory.
struct RecordServer {
    base: &'static str,
    dir: PathBuf,
}

impl HttpTransport for RecordServer {
    fn get(&self, url: &str) -> Result<HttpResponse, AttestError> {
        let name = url
            .strip_prefix(self.base)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or_default();
        Ok(match fs::read(self.dir.join(name)) {
            Ok(body) if !name.is_empty() => HttpResponse { status: 200, body },
            _ => HttpResponse {
                status: 404,
                body: Vec::new(),
            },
        })
    }

    fn post(&self, _url: &str, _body: &[u8]) -> Result<HttpResponse, AttestError> {
        Ok(HttpResponse {
            status: 405,
            body: Vec::new(),
        })
    }
}

/// A log that includes every leaf right away, cosigned by one witness.
struct InstantLog {
    log: KeyPair,
    witness: KeyPair,
    leaves: Mutex<Vec<Hash>>,
}

impl InstantLog {
    fn new() -> Self {
        InstantLog {
            log: KeyPair::from_seed(Seed::new([21u8; 32])),
            witness: KeyPair::from_seed(Seed::new([22u8; 32])),
            leaves: Mutex::new(vec![[0xaa; 32], [0xbb; 32]]),
        }
    }

    fn policy(&self) -> Policy {
        Policy::parse(&format!(
            "log {} https://log.test\nwitness w1 {}\nquorum w1\n",
            hex::encode(*self.log.pk),
            hex::encode(*self.witness.pk)
        ))
        .unwrap()
    }

    fn respond(status: u16, body: String) -> Result<HttpResponse, AttestError> {
        Ok(HttpResponse {
            status,
            body: body.into_bytes(),
        })
    }
}

impl HttpTransport for InstantLog {
    fn get(&self, url: &str) -> Result<HttpResponse, AttestError> {
        let leaves = self.leaves.lock().unwrap();
        if url.ends_with("/get-tree-head") {
            let head = TreeHead {
                size: leaves.len() as u64,
                root_hash: tree_root(&leaves),
            };
            let log_kh = key_hash(&self.log.pk);
            let cth = CosignedTreeHead {
                tree_head: head,
                signature: *self.log.sk.sign(head.checkpoint(&log_kh), None),
                cosignatures: vec![Cosignature {
                    key_hash: key_hash(&self.witness.pk),
                    timestamp: COSIGNED_AT,
                    signature: *self
                        .witness
                        .sk
                        .sign(head.cosigned_data(&log_kh, COSIGNED_AT), None),
                }],
            };
            return Self::respond(200, cth.to_ascii());
        }
        if let Some((_, hash)) = url
            .split("/get-inclusion-proof/")
            .nth(1)
            .and_then(|rest| rest.split_once('/'))
        {
            let hash = hex::decode(hash).unwrap();
            if let Some(index) = leaves.iter().position(|l| l[..] == hash[..]) {
                let proof = InclusionProof {
                    leaf_index: index as u64,
                    node_hashes: inclusion_path(index, &leaves),
                };
                return Self::respond(200, proof.to_ascii());
            }
        }
        Self::respond(404, String::new())
    }

    fn post(&self, url: &str, body: &[u8]) -> Result<HttpResponse, AttestError> {
        if !url.ends_with("/add-leaf") {
            return Self::respond(404, String::new());
        }
        let request = LeafRequest::from_ascii(std::str::from_utf8(body).unwrap())?;
        if request.verify().is_err() {
            return Self::respond(403, String::new());
        }
        let hash = request.leaf().hash();
        let mut leaves = self.leaves.lock().unwrap();
        if !leaves.contains(&hash) {
            leaves.push(hash);
        }
        Self::respond(200, String::new())
    }
}

/// No network at provisioning time.
struct Offline;

impl HttpTransport for Offline {
    fn get(&self, url: &str) -> Result<HttpResponse, AttestError> {
        Err(AttestError::NetworkError(format!("offline: {}", url)))
    }

    fn post(&self, url: &str, _body: &[u8]) -> Result<HttpResponse, AttestError> {
        Err(AttestError::NetworkError(format!("offline: {}", url)))
    }
}

#[test]
fn test_vendor_signature_flow() {
    const UDI: &str = "0133708100000011";
    let dir = scratch("vendor");
    let (app, apps) = signer_app();
    let registry = firmwares(UDI, &firmware_image());

    let vendor = KeySigner::from_seed([31u8; 32]);
    let mut vendor_keys = VendorKeys::default();
    vendor_keys
        .insert(VendorKey {
            public_key: vendor.public_key(),
            tag: app.tag().to_string(),
            app_hash: *app.hash(),
        })
        .unwrap();

    let store = RecordStore::new(dir.join("signatures"), dir.join("submissions"));
    store.create_dirs().unwrap();
    let service = SignerService::new(Box::new(VendorAuthority::new(Box::new(vendor))), store, time());

    let session = device(UDI, 1);
    assert_eq!(
        provision(&session, &app, &registry, &service).unwrap(),
        RecordKind::Signature
    );
    assert!(session.is_closed());
    assert!(dir.join("signatures").join(UDI).is_file());

    // published on a web server
    let server = RecordServer {
        base: "https://records.test/verify",
        dir: dir.join("signatures"),
    };
    let source = RecordSource::Url {
        base: "https://records.test/verify/".to_string(),
        transport: &server,
    };
    let verifier = Verifier::new(&apps, &registry).with_vendor_keys(&vendor_keys);
    let verified = verifier.verify(&device(UDI, 1), &source).unwrap();
    assert_eq!(verified.udi.to_hex(), UDI);
    assert_eq!(verified.record.app_tag, "verisigner-v0.0.3");

    // a product 2 device never carries a Sigsum proof
    let strict = Verifier::new(&apps, &registry)
        .with_vendor_keys(&vendor_keys)
        .require_proof(true);
    assert!(matches!(
        strict.verify(&device(UDI, 1), &source),
        Err(AttestError::ConfigError(_))
    ));

    // an unprovisioned device has no record
    const OTHER: &str = "0133708100000012";
    let other = firmwares(OTHER, &firmware_image());
    let verifier = Verifier::new(&apps, &other).with_vendor_keys(&vendor_keys);
    let session = device(OTHER, 2);
    assert!(matches!(
        verifier.verify(&session, &source),
        Err(AttestError::NotFound(_))
    ));
    assert!(session.is_closed());
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_wrong_firmware_leaves_no_record() {
    const UDI: &str = "0133708100000013";
    let dir = scratch("firmware");
    let (app, _) = signer_app();
    let mut other_image = firmware_image();
    other_image[100] ^= 0xff;
    let registry = firmwares(UDI, &other_image);

    let store = RecordStore::new(dir.join("signatures"), dir.join("submissions"));
    store.create_dirs().unwrap();
    let vendor = KeySigner::from_seed([32u8; 32]);
    let service = SignerService::new(Box::new(VendorAuthority::new(Box::new(vendor))), store, time());

    let session = device(UDI, 3);
    let err = provision(&session, &app, &registry, &service).unwrap_err();
    assert!(matches!(err, AttestError::WrongFirmware));
    assert!(session.is_closed());
    assert_eq!(fs::read_dir(dir.join("signatures")).unwrap().count(), 0);
    fs::remove_dir_all(&dir).ok();
}

fn submit_log(submit: &KeySigner, app: &AppBin, policy: Policy) -> SigsumLog {
    let key = SubmitKey {
        name: "provisioning station".to_string(),
        public_key: submit.public_key(),
        tag: app.tag().to_string(),
        app_hash: *app.hash(),
        validity: None,
    };
    SigsumLog::new(vec![key], policy).unwrap()
}

fn make_dirs(dirs: &[&Path]) {
    for d in dirs {
        fs::create_dir_all(d).unwrap();
    }
}

#[test]
fn test_deferred_sigsum_flow() {
    const UDI: &str = "013370c100000014";
    let dir = scratch("sigsum");
    let (app, apps) = signer_app();
    let registry = firmwares(UDI, &firmware_image());
    let log = InstantLog::new();
    let submit = KeySigner::from_seed([33u8; 32]);
    let sigsum = submit_log(&submit, &app, log.policy());

    let store = RecordStore::new(dir.join("signatures"), dir.join("submissions"));
    store.create_dirs().unwrap();
    let authority = SigsumAuthority::new(Box::new(submit), sigsum.clone(), Box::new(Offline), true).unwrap();
    let service = SignerService::new(Box::new(authority), store, time());

    assert_eq!(
        provision(&device(UDI, 4), &app, &registry, &service).unwrap(),
        RecordKind::Submission
    );
    assert!(dir.join("submissions").join(UDI).is_file());

    let dirs = BatchDirs {
        submissions: dir.join("submissions"),
        processed: dir.join("processed"),
        verifications: dir.join("verification"),
    };
    make_dirs(&[&dirs.processed, &dirs.verifications]);
    let entry = &sigsum.policy().logs()[0];
    let client = LogClient::new(&log, entry, None).unwrap();
    let written = process_submissions(&dirs, &sigsum, &client).unwrap();
    assert_eq!(written, vec![dirs.verifications.join(UDI)]);
    assert!(dirs.processed.join(UDI).is_file());
    assert!(!dirs.submissions.join(UDI).exists());

    let verifier = Verifier::new(&apps, &registry).with_sigsum(&sigsum);
    let verified = verifier
        .verify(&device(UDI, 4), &RecordSource::Dir(dirs.verifications.clone()))
        .unwrap();
    assert!(verified.attested_by.contains("provisioning station"));

    // vendor keys alone cannot check a proof
    let vendor_only = VendorKeys::default();
    let verifier = Verifier::new(&apps, &registry).with_vendor_keys(&vendor_only);
    assert!(matches!(
        verifier.verify(&device(UDI, 4), &RecordSource::Dir(dirs.verifications.clone())),
        Err(AttestError::ConfigError(_))
    ));

    // the same record does not vouch for a different device secret
    let verifier = Verifier::new(&apps, &registry).with_sigsum(&sigsum);
    assert!(verifier
        .verify(&device(UDI, 5), &RecordSource::Dir(dirs.verifications.clone()))
        .is_err());
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_immediate_sigsum_flow() {
    const UDI: &str = "013370c100000015";
    let dir = scratch("immediate");
    let (app, apps) = signer_app();
    let registry = firmwares(UDI, &firmware_image());
    let log = InstantLog::new();
    let submit = KeySigner::from_seed([34u8; 32]);
    let sigsum = submit_log(&submit, &app, log.policy());

    let store = RecordStore::new(dir.join("signatures"), dir.join("submissions"));
    store.create_dirs().unwrap();
    let authority = SigsumAuthority::new(Box::new(submit), sigsum.clone(), Box::new(log), false).unwrap();
    let service = SignerService::new(Box::new(authority), store, time());

    assert_eq!(
        provision(&device(UDI, 6), &app, &registry, &service).unwrap(),
        RecordKind::Proof
    );
    let verifier = Verifier::new(&apps, &registry).with_sigsum(&sigsum).require_proof(true);
    verifier
        .verify(&device(UDI, 6), &RecordSource::Dir(dir.join("signatures")))
        .unwrap();
    fs::remove_dir_all(&dir).ok();
}
