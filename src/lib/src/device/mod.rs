//! Device sessions
//!
//! A session is an open connection to one device in firmware mode. The
//! signer app can be loaded once per session; after that the session signs
//! with the app key and reports the firmware digest.
//!
//! The attestation flow owns the session through a [`SharedSession`]. A
//! signal handler holds a clone of the same handle. Its `close()` never
//! waits for a device operation in progress: the session is marked closing
//! and the running operation closes the device as soon as it returns. A
//! [`SessionGuard`] closes it on every other exit path.

use crate::appbins::AppBin;
use crate::error::AttestError;
use crate::udi::Udi;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

pub mod software;

pub use software::SoftwareDevice;

pub trait DeviceSession: Send {
    fn udi(&self) -> Udi;

    /// Load the app and return its ed25519 public key.
    fn load_app(&mut self, app: &AppBin) -> Result<[u8; 32], AttestError>;

    /// Sign with the loaded app key.
    fn sign(&mut self, message: &[u8]) -> Result<[u8; 64], AttestError>;

    /// SHA-512 over the first `size` bytes of the firmware.
    fn firmware_digest(&mut self, size: usize) -> Result<[u8; 64], AttestError>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Cloneable handle to one session.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Box<dyn DeviceSession>>>,
    closing: Arc<AtomicBool>,
}

fn close_locked(device: &mut Box<dyn DeviceSession>) {
    if !device.is_closed() {
        log::debug!("Closing device {}", device.udi().to_hex());
        device.close();
    }
}

impl SharedSession {
    pub fn new(session: impl DeviceSession + 'static) -> Self {
        SharedSession {
            inner: Arc::new(Mutex::new(Box::new(session))),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn DeviceSession>>, AttestError> {
        self.inner
            .lock()
            .map_err(|e| AttestError::InternalError(format!("Lock poisoned: {}", e)))
    }

    /// Run one device operation, honouring a close requested meanwhile.
    fn with_device<T>(
        &self,
        op: impl FnOnce(&mut Box<dyn DeviceSession>) -> Result<T, AttestError>,
    ) -> Result<T, AttestError> {
        let mut device = self.lock()?;
        if self.closing.load(Ordering::SeqCst) {
            close_locked(&mut device);
        }
        let result = op(&mut device);
        if self.closing.load(Ordering::SeqCst) {
            close_locked(&mut device);
        }
        result
    }

    pub fn udi(&self) -> Result<Udi, AttestError> {
        Ok(self.lock()?.udi())
    }

    pub fn load_app(&self, app: &AppBin) -> Result<[u8; 32], AttestError> {
        self.with_device(|d| d.load_app(app))
    }

    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], AttestError> {
        self.with_device(|d| d.sign(message))
    }

    pub fn firmware_digest(&self, size: usize) -> Result<[u8; 64], AttestError> {
        self.with_device(|d| d.firmware_digest(size))
    }

    /// Close the device. Safe to call more than once and from a signal handler.
    ///
    /// Does not wait for a running operation; that operation closes the
    /// device when it returns.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        match self.inner.try_lock() {
            Ok(mut device) => close_locked(&mut device),
            // a poisoned lock still holds a device that must be closed
            Err(TryLockError::Poisoned(poisoned)) => close_locked(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                log::debug!("Device busy, closing when the running operation returns")
            }
        }
    }

    /// True once a close was requested.
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn guard(&self) -> SessionGuard {
        SessionGuard {
            session: self.clone(),
        }
    }
}

/// Closes the session when dropped.
pub struct SessionGuard {
    session: SharedSession,
}

impl SessionGuard {
    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SoftwareDevice {
        SoftwareDevice::new(
            [9u8; 32],
            Udi::from_hex("0133708100000002").unwrap(),
            vec![0xa5; 4096],
        )
    }

    #[test]
    fn test_guard_closes_on_drop() {
        let session = SharedSession::new(device());
        {
            let guard = session.guard();
            guard
                .session()
                .load_app(&AppBin::new("verisigner-v0.0.3", b"app".to_vec()))
                .unwrap();
            assert!(!session.is_closed());
        }
        assert!(session.is_closed());
        assert!(matches!(
            session.sign(b"late"),
            Err(AttestError::DeviceError(_))
        ));
    }

    #[test]
    fn test_close_from_other_thread() {
        let session = SharedSession::new(device());
        let handle = session.clone();
        std::thread::spawn(move || handle.close()).join().unwrap();
        assert!(session.is_closed());
        session.close();
        assert_eq!(session.udi().unwrap().to_hex(), "0133708100000002");
    }

    /// Signs only after the test releases it.
    struct SlowDevice {
        release: std::sync::mpsc::Receiver<()>,
        closed: Arc<AtomicBool>,
    }

    impl DeviceSession for SlowDevice {
        fn udi(&self) -> Udi {
            Udi::from_hex("0133708100000003").unwrap()
        }

        fn load_app(&mut self, _app: &AppBin) -> Result<[u8; 32], AttestError> {
            Ok([0u8; 32])
        }

        fn sign(&mut self, _message: &[u8]) -> Result<[u8; 64], AttestError> {
            self.release.recv().unwrap();
            Ok([1u8; 64])
        }

        fn firmware_digest(&mut self, _size: usize) -> Result<[u8; 64], AttestError> {
            Ok([0u8; 64])
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_close_does_not_wait_for_running_operation() {
        let (release, wait) = std::sync::mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let session = SharedSession::new(SlowDevice {
            release: wait,
            closed: Arc::clone(&closed),
        });

        let signing = session.clone();
        let worker = std::thread::spawn(move || signing.sign(b"challenge"));
        // wait until the worker holds the device
        while session.inner.try_lock().is_ok() {
            std::thread::yield_now();
        }

        session.close();
        assert!(session.is_closed());
        assert!(!closed.load(Ordering::SeqCst));

        release.send(()).unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), [1u8; 64]);
        assert!(closed.load(Ordering::SeqCst));
    }
}
