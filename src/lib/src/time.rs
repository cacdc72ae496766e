//! Clock abstraction for record timestamps
//!
//! Verification records and submissions carry the time they were made. The
//! signer takes that time from a [`TimeSource`] so tests can pin it and a
//! badly set system clock is caught: no record can predate the build of the
//! binary that writes it.
//!
//! Timestamps are RFC 3339 in UTC with second precision on output, and any
//! RFC 3339 offset on input.

use crate::error::AttestError;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Unix time at which the library was compiled.
pub const BUILD_TIMESTAMP: i64 = {
    match option_env!("DEVATTEST_BUILD_TIMESTAMP") {
        Some(s) => {
            let bytes = s.as_bytes();
            let mut result: i64 = 0;
            let mut i = 0;
            while i < bytes.len() {
                let digit = (bytes[i] - b'0') as i64;
                result = result * 10 + digit;
                i += 1;
            }
            result
        }
        // 2025-01-01 00:00:00 UTC
        None => 1735689600,
    }
};

pub trait TimeSource: Send + Sync {
    fn now(&self) -> Result<DateTime<Utc>, AttestError>;
}

/// The system clock, refused when it reads earlier than the build time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<DateTime<Utc>, AttestError> {
        let now = Utc::now();
        if now.timestamp() < BUILD_TIMESTAMP {
            return Err(AttestError::TimeError(format!(
                "system clock {} is before build time {}",
                format_rfc3339(&now),
                BUILD_TIMESTAMP
            )));
        }
        Ok(now)
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    timestamp: DateTime<Utc>,
}

impl FixedTimeSource {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        FixedTimeSource { timestamp }
    }

    pub fn from_unix_secs(secs: i64) -> Result<Self, AttestError> {
        let timestamp = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| AttestError::TimeError(format!("invalid Unix time {}", secs)))?;
        Ok(Self::new(timestamp))
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Result<DateTime<Utc>, AttestError> {
        Ok(self.timestamp)
    }
}

/// `2025-09-02T11:08:03Z`
pub fn format_rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, AttestError> {
    Ok(DateTime::parse_from_rfc3339(s.trim())?.with_timezone(&Utc))
}

/// Unix seconds as carried by witness cosignatures.
pub fn from_unix(secs: u64) -> Result<DateTime<Utc>, AttestError> {
    let secs = i64::try_from(secs)
        .map_err(|_| AttestError::ParseError(format!("invalid timestamp: {}", secs)))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AttestError::ParseError(format!("invalid timestamp: {}", secs)))
}
