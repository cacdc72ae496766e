//! Sigsum log client
//!
//! Submits a leaf request, polls until the log reports it as included,
//! then collects a tree head and an inclusion proof into a [`SigsumProof`].

use super::leaf::LeafRequest;
use super::merkle::Hash;
use super::policy::LogEntry;
use super::proof::{InclusionProof, ShortLeaf, SigsumProof};
use super::tree_head::CosignedTreeHead;
use crate::error::AttestError;
use crate::transport::{HttpResponse, HttpTransport};
use std::thread;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

pub struct LogClient<'a> {
    transport: &'a dyn HttpTransport,
    log: LogEntry,
    url: String,
    poll_interval: Duration,
    max_attempts: u32,
}

fn unexpected(what: &str, response: &HttpResponse) -> AttestError {
    let text = String::from_utf8_lossy(&response.body);
    AttestError::NetworkError(format!(
        "{} failed with status {}: {}",
        what,
        response.status,
        text.trim()
    ))
}

impl<'a> LogClient<'a> {
    /// Client for `log`, using its policy URL unless `url` overrides it.
    pub fn new(
        transport: &'a dyn HttpTransport,
        log: &LogEntry,
        url: Option<&str>,
    ) -> Result<Self, AttestError> {
        let url = url
            .or(log.url.as_deref())
            .ok_or_else(|| {
                AttestError::ConfigError(format!(
                    "no URL for log {}",
                    hex::encode(log.key_hash)
                ))
            })?
            .trim_end_matches('/')
            .to_string();
        Ok(LogClient {
            transport,
            log: log.clone(),
            url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns true once the leaf is included, false while it is pending.
    pub fn add_leaf(&self, request: &LeafRequest) -> Result<bool, AttestError> {
        let response = self.transport.post(
            &format!("{}/add-leaf", self.url),
            request.to_ascii().as_bytes(),
        )?;
        match response.status {
            200 => Ok(true),
            202 => Ok(false),
            _ => Err(unexpected("add-leaf", &response)),
        }
    }

    pub fn get_tree_head(&self) -> Result<CosignedTreeHead, AttestError> {
        let response = self.transport.get(&format!("{}/get-tree-head", self.url))?;
        if response.status != 200 {
            return Err(unexpected("get-tree-head", &response));
        }
        let head = CosignedTreeHead::from_ascii(response.body_text()?)?;
        head.verify_signature(&self.log.public_key)?;
        Ok(head)
    }

    /// `None` when the log does not have the leaf in a tree of this size yet.
    pub fn get_inclusion_proof(
        &self,
        size: u64,
        leaf_hash: &Hash,
    ) -> Result<Option<InclusionProof>, AttestError> {
        if size == 1 {
            return Ok(Some(InclusionProof::default()));
        }
        let response = self.transport.get(&format!(
            "{}/get-inclusion-proof/{}/{}",
            self.url,
            size,
            hex::encode(leaf_hash)
        ))?;
        match response.status {
            200 => Ok(Some(InclusionProof::from_ascii(response.body_text()?)?)),
            404 => Ok(None),
            _ => Err(unexpected("get-inclusion-proof", &response)),
        }
    }

    /// Submit `request` and wait for a proof of logging.
    pub fn submit(&self, request: &LeafRequest) -> Result<SigsumProof, AttestError> {
        let leaf_hash = request.leaf().hash();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                thread::sleep(self.poll_interval);
            }
            if !self.add_leaf(request)? {
                log::debug!("Leaf {} pending (attempt {})", hex::encode(leaf_hash), attempt);
                continue;
            }
            let tree_head = self.get_tree_head()?;
            let Some(inclusion) = self.get_inclusion_proof(tree_head.tree_head.size, &leaf_hash)? else {
                log::debug!("Leaf not yet in tree of size {}", tree_head.tree_head.size);
                continue;
            };
            log::info!(
                "Leaf {} logged in tree of size {}",
                hex::encode(leaf_hash),
                tree_head.tree_head.size
            );
            return Ok(SigsumProof {
                log_key_hash: self.log.key_hash,
                leaf: ShortLeaf {
                    key_hash: request.key_hash(),
                    signature: request.signature,
                },
                tree_head,
                inclusion,
            });
        }
        Err(AttestError::NetworkError(format!(
            "leaf not logged after {} attempts",
            self.max_attempts
        )))
    }
}

/// In-memory log answering the client endpoints.
#[cfg(test)]
pub(crate) mod testlog {
    use super::*;
    use crate::sigsum::leaf::key_hash;
    use crate::sigsum::merkle::{inclusion_path, leaf_hash, tree_root};
    use crate::sigsum::tree_head::{Cosignature, TreeHead};
    use ed25519_compact::KeyPair;
    use std::sync::Mutex;

    pub struct TestLog {
        pub log: KeyPair,
        pub witness: KeyPair,
        pub cosign_time: u64,
        pub pending_rounds: u32,
        state: Mutex<(Vec<Hash>, u32)>,
    }

    impl TestLog {
        pub fn new(log: KeyPair, witness: KeyPair, cosign_time: u64, pending_rounds: u32) -> Self {
            // a few unrelated leaves so proofs are not trivial
            let filler = (0u64..3).map(|i| leaf_hash(&i.to_be_bytes())).collect();
            TestLog {
                log,
                witness,
                cosign_time,
                pending_rounds,
                state: Mutex::new((filler, 0)),
            }
        }

        fn ok(body: String) -> HttpResponse {
            HttpResponse {
                status: 200,
                body: body.into_bytes(),
            }
        }

        fn status(status: u16) -> HttpResponse {
            HttpResponse {
                status,
                body: Vec::new(),
            }
        }
    }

    impl HttpTransport for TestLog {
        fn get(&self, url: &str) -> Result<HttpResponse, AttestError> {
            let state = self.state.lock().unwrap();
            let leaves = &state.0;
            if url.ends_with("/get-tree-head") {
                let head = TreeHead {
                    size: leaves.len() as u64,
                    root_hash: tree_root(leaves),
                };
                let log_kh = key_hash(&self.log.pk);
                let cth = CosignedTreeHead {
                    tree_head: head,
                    signature: *self.log.sk.sign(head.checkpoint(&log_kh), None),
                    cosignatures: vec![Cosignature {
                        key_hash: key_hash(&self.witness.pk),
                        timestamp: self.cosign_time,
                        signature: *self
                            .witness
                            .sk
                            .sign(head.cosigned_data(&log_kh, self.cosign_time), None),
                    }],
                };
                return Ok(Self::ok(cth.to_ascii()));
            }
            if let Some(rest) = url.split("/get-inclusion-proof/").nth(1) {
                let (_, hash) = rest.split_once('/').unwrap();
                let hash = hex::decode(hash).unwrap();
                let Some(index) = leaves.iter().position(|l| l[..] == hash[..]) else {
                    return Ok(Self::status(404));
                };
                let proof = InclusionProof {
                    leaf_index: index as u64,
                    node_hashes: inclusion_path(index, leaves),
                };
                let mut body = String::new();
                proof.write(&mut body);
                return Ok(Self::ok(body));
            }
            Ok(Self::status(404))
        }

        fn post(&self, url: &str, body: &[u8]) -> Result<HttpResponse, AttestError> {
            if !url.ends_with("/add-leaf") {
                return Ok(Self::status(404));
            }
            let request = LeafRequest::from_ascii(std::str::from_utf8(body).unwrap())?;
            if request.verify().is_err() {
                return Ok(Self::status(403));
            }
            let mut state = self.state.lock().unwrap();
            let hash = request.leaf().hash();
            if !state.0.contains(&hash) {
                state.0.push(hash);
            }
            state.1 += 1;
            if state.1 <= self.pending_rounds {
                return Ok(Self::status(202));
            }
            Ok(Self::status(200))
        }
    }
}
