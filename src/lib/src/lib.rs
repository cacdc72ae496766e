//! Hardware device attestation with vendor signatures or Sigsum proofs.

// A vendor binds a device's identity, firmware digest and signer app public key
// into one message and vouches for it. `protocol::provision()` runs the device side,
// `verify::Verifier` is what relying parties use to check a device later.

#![forbid(unsafe_code)]

mod error;
mod hexutil;

/// Unique Device Identifier decoding and encoding
pub mod udi;

/// Known firmware per hardware model
///
/// Maps the hardware part of a UDI to the size and SHA-512 digest of the
/// firmware that model must run. A compiled-in table is available through
/// [`firmware::FirmwareRegistry::builtin`].
pub mod firmware;

/// Device app binaries addressed by digest
pub mod appbins;

/// Vendor signing keys
pub mod vendorkey;

/// The 104-byte attested message
pub mod message;

/// Device sessions and the software-emulated device
pub mod device;

/// Device side of the attestation protocol
pub mod protocol;

/// Vendor side: authorities, record store and the signing service
pub mod signer;

/// Sigsum transparency log proofs
///
/// Parsing and verification of Sigsum proofs, trust policies with witness
/// quorums, submit keys with validity windows, and a small log client.
pub mod sigsum;

/// Verification records and submissions
pub mod record;

/// Signing RPC over mutually authenticated TLS
pub mod rpc;

/// Batch processing of deferred Sigsum submissions
pub mod batch;

/// Relying party verification
pub mod verify;

/// Signer server and client configuration
pub mod config;

/// HTTP requests to logs and record servers
pub mod transport;

/// Secure file operations with restrictive permissions
///
/// Records, submissions and key material are written with mode 0600 and
/// never overwrite an existing file.
pub mod secure_file;

/// Time sources for record timestamps
pub mod time;

pub use error::*;

pub mod reexports {
    pub use {getrandom, log, regex, thiserror};
}
