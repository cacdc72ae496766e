use std::fmt;

/// Coarse error classes that operators see in front of every failure message.
///
/// A verification failure must never read like a network hiccup, so the
/// classes map one to one to the prefixes printed by the command line tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Parse,
    NotFound,
    Length,
    VerificationFailed,
    Io,
    AlreadyExists,
    Usage,
    Internal,
}

impl ErrorClass {
    /// The machine readable name used on the signing RPC wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Parse => "parse",
            ErrorClass::NotFound => "not-found",
            ErrorClass::Length => "length",
            ErrorClass::VerificationFailed => "verification-failed",
            ErrorClass::Io => "io",
            ErrorClass::AlreadyExists => "already-exists",
            ErrorClass::Usage => "usage",
            ErrorClass::Internal => "internal",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "parse" => ErrorClass::Parse,
            "not-found" => ErrorClass::NotFound,
            "length" => ErrorClass::Length,
            "verification-failed" => ErrorClass::VerificationFailed,
            "io" => ErrorClass::Io,
            "already-exists" => ErrorClass::AlreadyExists,
            "usage" => ErrorClass::Usage,
            _ => ErrorClass::Internal,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Parse => "PARSE ERROR",
            ErrorClass::NotFound => "NOT FOUND",
            ErrorClass::Length => "LENGTH ERROR",
            ErrorClass::VerificationFailed => "VERIFICATION FAILED",
            ErrorClass::Io => "I/O FAILED",
            ErrorClass::AlreadyExists => "ALREADY EXISTS",
            ErrorClass::Usage => "USAGE ERROR",
            ErrorClass::Internal => "MISSING IN PROGRAM",
        };
        write!(f, "{s}")
    }
}

/// The device attestation error type.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Usage error: {0}")]
    UsageError(&'static str),

    #[error("Wrong UDI length: expected 8 bytes, got {0}")]
    WrongUdiLength(usize),

    #[error("Reserved UDI bits not zero")]
    WrongUdiData,

    #[error("Wrong length of {what}: expected {expected} bytes, got {got}")]
    WrongLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{field} {value} out of range (max {max})")]
    FieldOutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("Firmware size {0} outside [2000, 8192]")]
    FirmwareSize(usize),

    #[error("UDI0 {given} does not match {calculated} calculated from the hardware triple")]
    Udi0Mismatch { given: String, calculated: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("App digest mismatch for {tag}: expected {expected}, computed {computed}")]
    AppDigestMismatch {
        tag: String,
        expected: String,
        computed: String,
    },

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Device signature over challenge failed verification")]
    ChallengeFailed,

    #[error("Firmware digest does not match the expected firmware")]
    WrongFirmware,

    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("Bad leaf: {0}")]
    BadLeaf(String),

    #[error("Bad inclusion proof: {0}")]
    BadInclusion(String),

    #[error("Bad tree head: {0}")]
    BadTreeHead(String),

    #[error("Witness quorum not met ({valid} valid cosignatures)")]
    QuorumNotMet { valid: usize },

    #[error("Witness cosignature at {timestamp} outside key validity {start} - {end}")]
    OutsideValidityWindow {
        timestamp: String,
        start: String,
        end: String,
    },

    #[error("Ed25519 signature function error")]
    CryptoError(#[from] ed25519_compact::Error),

    #[error("App {app} is not the app of submit key {key}")]
    SubmitKeyApp { app: String, key: String },

    #[error("{0} directory must be empty")]
    DirectoryNotEmpty(&'static str),

    #[error("invalid submission file {file}: {reason}")]
    InvalidSubmission { file: String, reason: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Signer reported: {message}")]
    Remote { class: ErrorClass, message: String },

    #[error("Time error: {0}")]
    TimeError(String),

    #[error("Protocol step '{step}' not allowed in state {state}")]
    ProtocolOrder { step: &'static str, state: String },
}

impl AttestError {
    /// The class an operator sees this error under.
    pub fn class(&self) -> ErrorClass {
        match self {
            AttestError::ParseError(_)
            | AttestError::JsonError(_)
            | AttestError::ConfigError(_)
            | AttestError::WrongUdiData
            | AttestError::FieldOutOfRange { .. }
            | AttestError::FirmwareSize(_)
            | AttestError::Udi0Mismatch { .. }
            | AttestError::AppDigestMismatch { .. }
            | AttestError::InvalidSubmission { .. } => ErrorClass::Parse,

            AttestError::WrongUdiLength(_) | AttestError::WrongLength { .. } => ErrorClass::Length,

            AttestError::NotFound(_) => ErrorClass::NotFound,

            AttestError::AlreadyExists(_) | AttestError::DirectoryNotEmpty(_) => {
                ErrorClass::AlreadyExists
            }

            AttestError::ChallengeFailed
            | AttestError::WrongFirmware
            | AttestError::VerificationFailed(_)
            | AttestError::BadLeaf(_)
            | AttestError::BadInclusion(_)
            | AttestError::BadTreeHead(_)
            | AttestError::QuorumNotMet { .. }
            | AttestError::OutsideValidityWindow { .. }
            | AttestError::SubmitKeyApp { .. }
            | AttestError::CryptoError(_) => ErrorClass::VerificationFailed,

            AttestError::IOError(_)
            | AttestError::NetworkError(_)
            | AttestError::DeviceError(_)
            | AttestError::TlsError(_)
            | AttestError::RpcError(_) => ErrorClass::Io,

            AttestError::Remote { class, .. } => *class,

            AttestError::UsageError(_) => ErrorClass::Usage,

            AttestError::InternalError(_)
            | AttestError::TimeError(_)
            | AttestError::ProtocolOrder { .. } => ErrorClass::Internal,
        }
    }
}

impl From<hex::FromHexError> for AttestError {
    fn from(err: hex::FromHexError) -> Self {
        AttestError::ParseError(format!("invalid hex: {}", err))
    }
}

impl From<chrono::ParseError> for AttestError {
    fn from(err: chrono::ParseError) -> Self {
        AttestError::ParseError(format!("invalid RFC 3339 time: {}", err))
    }
}

impl From<toml::de::Error> for AttestError {
    fn from(err: toml::de::Error) -> Self {
        AttestError::ConfigError(err.to_string())
    }
}

impl From<ureq::Error> for AttestError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Io(e) => AttestError::IOError(e),
            other => AttestError::NetworkError(other.to_string()),
        }
    }
}

impl From<rustls::Error> for AttestError {
    fn from(err: rustls::Error) -> Self {
        AttestError::TlsError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AttestError::WrongUdiData;
        assert_eq!(err.to_string(), "Reserved UDI bits not zero");

        let err = AttestError::WrongLength {
            what: "firmware hash",
            expected: 64,
            got: 63,
        };
        assert_eq!(
            err.to_string(),
            "Wrong length of firmware hash: expected 64 bytes, got 63"
        );

        let err = AttestError::DirectoryNotEmpty("verification");
        assert_eq!(err.to_string(), "verification directory must be empty");

        let err = AttestError::DirectoryNotEmpty("processed submission");
        assert_eq!(
            err.to_string(),
            "processed submission directory must be empty"
        );

        let err = AttestError::QuorumNotMet { valid: 0 };
        assert_eq!(err.to_string(), "Witness quorum not met (0 valid cosignatures)");

        let err = AttestError::InvalidSubmission {
            file: "0001".to_string(),
            reason: "bad json".to_string(),
        };
        assert!(err.to_string().starts_with("invalid submission file"));
    }

    #[test]
    fn test_error_classes_are_distinct() {
        assert_eq!(
            AttestError::BadInclusion("x".into()).class(),
            ErrorClass::VerificationFailed
        );
        assert_eq!(AttestError::NotFound("udi".into()).class(), ErrorClass::NotFound);
        assert_eq!(
            AttestError::NetworkError("timeout".into()).class(),
            ErrorClass::Io
        );
        assert_eq!(
            AttestError::AlreadyExists("0001".into()).class(),
            ErrorClass::AlreadyExists
        );
        assert_eq!(AttestError::WrongUdiLength(7).class(), ErrorClass::Length);
        assert_eq!(
            AttestError::Remote {
                class: ErrorClass::AlreadyExists,
                message: "x".into()
            }
            .class(),
            ErrorClass::AlreadyExists
        );
    }

    #[test]
    fn test_class_display() {
        assert_eq!(ErrorClass::VerificationFailed.to_string(), "VERIFICATION FAILED");
        assert_eq!(ErrorClass::NotFound.to_string(), "NOT FOUND");
        assert_eq!(ErrorClass::Io.to_string(), "I/O FAILED");
        assert_eq!(ErrorClass::Parse.to_string(), "PARSE ERROR");
    }

    #[test]
    fn test_class_wire_names_round_trip() {
        for class in [
            ErrorClass::Parse,
            ErrorClass::NotFound,
            ErrorClass::Length,
            ErrorClass::VerificationFailed,
            ErrorClass::Io,
            ErrorClass::AlreadyExists,
            ErrorClass::Usage,
            ErrorClass::Internal,
        ] {
            assert_eq!(ErrorClass::from_str_lossy(class.as_str()), class);
        }
    }
}
