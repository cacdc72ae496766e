//! Unique Device Identifier codec
//!
//! The device reports its UDI as two little-endian 32-bit words. The first
//! word packs, from the most significant bit down:
//!
//! ```text
//! | reserved (4) | vendor id (16) | product id (6) | product rev (6) |
//! ```
//!
//! The second word is a serial number. For display, storage and file names
//! the UDI is kept in big-endian form, which is each word byte-reversed.

use crate::error::AttestError;
use std::fmt;

/// Size of a UDI on the wire.
pub const UDI_SIZE: usize = 8;

const SIX_BITS: u8 = 0x3f;

/// The hardware model part of a UDI, used as the firmware registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hardware {
    pub vendor_id: u16,
    pub product_id: u8,
    pub product_rev: u8,
}

impl Hardware {
    pub fn new(vendor_id: u16, product_id: u8, product_rev: u8) -> Result<Self, AttestError> {
        check_six_bits("Product ID", product_id)?;
        check_six_bits("Product revision", product_rev)?;
        Ok(Hardware {
            vendor_id,
            product_id,
            product_rev,
        })
    }

    /// The first UDI word in big-endian form for this model.
    pub fn udi0_be(&self) -> [u8; 4] {
        let word = (u32::from(self.vendor_id) << 12)
            | (u32::from(self.product_id) << 6)
            | u32::from(self.product_rev);
        word.to_be_bytes()
    }

    pub fn udi0_hex(&self) -> String {
        hex::encode(self.udi0_be())
    }
}

impl fmt::Display for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VendorID: 0x{:04x} ProductID: {} ProductRev: {}",
            self.vendor_id, self.product_id, self.product_rev
        )
    }
}

fn check_six_bits(field: &'static str, value: u8) -> Result<(), AttestError> {
    if value > SIX_BITS {
        return Err(AttestError::FieldOutOfRange {
            field,
            value: u32::from(value),
            max: u32::from(SIX_BITS),
        });
    }
    Ok(())
}

/// Pack a hardware triple into the big-endian first UDI word.
///
/// Only ever used to cross-check data entered by hand against the triple it
/// claims to describe.
pub fn encode_udi0(vendor_id: u16, product_id: u8, product_rev: u8) -> Result<[u8; 4], AttestError> {
    Ok(Hardware::new(vendor_id, product_id, product_rev)?.udi0_be())
}

/// A decoded Unique Device Identifier. Immutable once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Udi {
    be: [u8; UDI_SIZE],
    hardware: Hardware,
}

impl Udi {
    /// Decode the raw little-endian form as returned by the device.
    pub fn from_raw_le(raw: &[u8]) -> Result<Self, AttestError> {
        let raw: [u8; UDI_SIZE] = raw
            .try_into()
            .map_err(|_| AttestError::WrongUdiLength(raw.len()))?;
        let vpr = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if (vpr >> 28) & 0xf != 0 {
            return Err(AttestError::WrongUdiData);
        }
        let hardware = Hardware {
            vendor_id: ((vpr >> 12) & 0xffff) as u16,
            product_id: ((vpr >> 6) & 0x3f) as u8,
            product_rev: (vpr & 0x3f) as u8,
        };
        Ok(Udi {
            be: swap_words(&raw),
            hardware,
        })
    }

    /// Decode the big-endian form, as used in file names and on the RPC.
    pub fn from_be_bytes(be: &[u8]) -> Result<Self, AttestError> {
        let be: [u8; UDI_SIZE] = be
            .try_into()
            .map_err(|_| AttestError::WrongUdiLength(be.len()))?;
        Self::from_raw_le(&swap_words(&be))
    }

    pub fn from_hex(s: &str) -> Result<Self, AttestError> {
        Self::from_be_bytes(&hex::decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; UDI_SIZE] {
        &self.be
    }

    pub fn to_raw_le(&self) -> [u8; UDI_SIZE] {
        swap_words(&self.be)
    }

    /// Lower-case hex of the big-endian form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.be)
    }

    pub fn hardware(&self) -> Hardware {
        self.hardware
    }

    pub fn vendor_id(&self) -> u16 {
        self.hardware.vendor_id
    }

    pub fn product_id(&self) -> u8 {
        self.hardware.product_id
    }

    pub fn product_rev(&self) -> u8 {
        self.hardware.product_rev
    }

    pub fn serial(&self) -> u32 {
        u32::from_be_bytes([self.be[4], self.be[5], self.be[6], self.be[7]])
    }
}

impl fmt::Display for Udi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}(BE) {}", self.to_hex(), self.hardware)
    }
}

fn swap_words(b: &[u8; UDI_SIZE]) -> [u8; UDI_SIZE] {
    [b[3], b[2], b[1], b[0], b[7], b[6], b[5], b[4]]
}
