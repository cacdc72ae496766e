//! Owner-only files for records and key material
//!
//! Verification records, submissions and TLS private keys are written with
//! mode 0600 on Unix. Records are created with create-new semantics, so a
//! device that already has a record can never be signed over again.

use crate::error::AttestError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

#[cfg(unix)]
pub const SECURE_FILE_MODE: u32 = 0o600;

/// Warn when a private file is readable or writable by group or others.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<(), AttestError> {
    use std::os::unix::fs::PermissionsExt;

    let perm_bits = fs::metadata(path)?.permissions().mode() & 0o777;
    if perm_bits & 0o077 != 0 {
        log::warn!(
            "File '{}' has permissive mode {:o}, expected 0600. Consider running: chmod 600 '{}'",
            path.display(),
            perm_bits,
            path.display()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> Result<(), AttestError> {
    log::debug!("Permission check skipped for '{}'", path.display());
    Ok(())
}

/// Create a file that must not exist yet, owner-only from the start.
pub fn create_new_secure_file(path: &Path) -> Result<File, AttestError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(SECURE_FILE_MODE);
    }
    options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => AttestError::AlreadyExists(path.display().to_string()),
        _ => AttestError::IOError(e),
    })
}

/// Write `data` to a new file. A partially written file is removed.
pub fn write_new_secure(path: &Path, data: &[u8]) -> Result<(), AttestError> {
    let mut file = create_new_secure_file(path)?;
    let res = file.write_all(data).and_then(|_| file.sync_all());
    if let Err(e) = res {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e.into());
    }
    Ok(())
}

/// Read a private file, warning about loose permissions.
pub fn read_secure(path: &Path) -> Result<Vec<u8>, AttestError> {
    check_permissions(path)?;
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    Ok(contents)
}
