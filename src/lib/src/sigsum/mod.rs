//! Sigsum transparency log support
//!
//! Leaf requests, proofs of logging and their verification against a trust
//! policy, plus a small client for the log HTTP API.

mod ascii;
pub mod client;
pub mod keys;
pub mod leaf;
pub mod merkle;
pub mod policy;
pub mod proof;
pub mod tree_head;

pub use client::LogClient;
pub use keys::{parse_submit_keys, SigsumLog, SubmitKey, Validity};
pub use leaf::{key_hash, KeyHash, Leaf, LeafRequest};
pub use merkle::Hash;
pub use policy::{LogEntry, Policy, Witness};
pub use proof::{InclusionProof, ShortLeaf, SigsumProof};
pub use tree_head::{Cosignature, CosignedTreeHead, TreeHead};
