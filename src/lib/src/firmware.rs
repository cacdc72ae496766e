//! Expected firmware per hardware model
//!
//! Each known hardware triple maps to the SHA-512 digest and size of the
//! firmware it ships with. The device is asked for a digest over exactly
//! `size` bytes of its firmware, so both values are needed to check it.
//!
//! Entries are written by hand, so every entry also carries the first UDI
//! word it is expected to produce. The registry recomputes that word from
//! the triple and refuses the entry on disagreement.

use crate::error::AttestError;
use crate::hexutil::to_array;
use crate::udi::{Hardware, Udi};
use std::collections::BTreeMap;

pub const FW_SIZE_MIN: usize = 2000;
pub const FW_SIZE_MAX: usize = 8192;
pub const FW_HASH_SIZE: usize = 64;

const BUILTIN_FIRMWARES: &str = include_str!("../data/firmwares.conf");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firmware {
    pub hash: [u8; FW_HASH_SIZE],
    pub size: usize,
}

/// Hardware triple to firmware mapping. Built once and then only read.
#[derive(Debug, Clone, Default)]
pub struct FirmwareRegistry {
    firmwares: BTreeMap<Hardware, Firmware>,
}

impl FirmwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The firmware table compiled into this library.
    pub fn builtin() -> Result<Self, AttestError> {
        let registry = Self::parse(BUILTIN_FIRMWARES)?;
        if registry.is_empty() {
            return Err(AttestError::InternalError(
                "no firmwares in the built-in table".to_string(),
            ));
        }
        Ok(registry)
    }

    /// Parse the line format
    /// `<udi0 hex> <vendor hex> <product> <rev> <size> <sha512 hex>`.
    pub fn parse(text: &str) -> Result<Self, AttestError> {
        let mut registry = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 6 {
                return Err(AttestError::ParseError(format!(
                    "firmware line {}: expected 6 fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let bad = |what: &str| {
                AttestError::ParseError(format!("firmware line {}: bad {}", lineno + 1, what))
            };
            let vendor_id = u16::from_str_radix(fields[1], 16).map_err(|_| bad("vendor ID"))?;
            let product_id: u8 = fields[2].parse().map_err(|_| bad("product ID"))?;
            let product_rev: u8 = fields[3].parse().map_err(|_| bad("product revision"))?;
            let size: usize = fields[4].parse().map_err(|_| bad("size"))?;
            let hash = hex::decode(fields[5])?;
            registry.add(fields[0], vendor_id, product_id, product_rev, size, &hash)?;
        }
        Ok(registry)
    }

    /// Register the firmware for one hardware model.
    pub fn add(
        &mut self,
        udi0_be_hex: &str,
        vendor_id: u16,
        product_id: u8,
        product_rev: u8,
        size: usize,
        hash: &[u8],
    ) -> Result<(), AttestError> {
        let udi0 = hex::decode(udi0_be_hex)?;
        let udi0: [u8; 4] = to_array(&udi0, "UDI0")?;
        let hardware = Hardware::new(vendor_id, product_id, product_rev)?;

        if !(FW_SIZE_MIN..=FW_SIZE_MAX).contains(&size) {
            return Err(AttestError::FirmwareSize(size));
        }
        let hash: [u8; FW_HASH_SIZE] = to_array(hash, "firmware hash")?;

        if udi0 != hardware.udi0_be() {
            return Err(AttestError::Udi0Mismatch {
                given: hex::encode(udi0),
                calculated: hardware.udi0_hex(),
            });
        }
        if self.firmwares.contains_key(&hardware) {
            return Err(AttestError::AlreadyExists(format!(
                "hardware with UDI0 0x{}",
                hardware.udi0_hex()
            )));
        }

        self.firmwares.insert(hardware, Firmware { hash, size });
        Ok(())
    }

    /// Expected firmware for the model a UDI belongs to.
    pub fn lookup(&self, udi: &Udi) -> Result<&Firmware, AttestError> {
        self.firmwares
            .get(&udi.hardware())
            .ok_or_else(|| AttestError::NotFound(format!("firmware for {}", udi.hardware())))
    }

    pub fn len(&self) -> usize {
        self.firmwares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.firmwares.is_empty()
    }

    /// One human readable line per known model.
    pub fn list(&self) -> Vec<String> {
        self.firmwares
            .iter()
            .map(|(hw, fw)| {
                format!(
                    "{} [0x{}] with size:{} hash:{}…",
                    hw,
                    hw.udi0_hex(),
                    fw.size,
                    hex::encode(&fw.hash[..16])
                )
            })
            .collect()
    }
}
