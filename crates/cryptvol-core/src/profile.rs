//! On-disk format profiles.
//!
//! A profile names the header format and produces the metadata the engine needs
//! to write or read it. `Device::format`/`Device::load` are generic over
//! [`FormatProfile`], so adding a format means adding a profile type here.

use cryptvol_provider::FormatMetadata;

pub const DEFAULT_HASH: &str = "sha256";
pub const DEFAULT_LUKS2_SECTOR_SIZE: u32 = 512;

pub const LUKS1: &str = "LUKS1";
pub const LUKS2: &str = "LUKS2";

/// Capability shared by every on-disk format profile.
pub trait FormatProfile {
    /// Engine-level format name, as later reported by `Device::type_name`.
    fn format_name(&self) -> &'static str;

    /// Format-specific metadata for format and load calls.
    fn metadata(&self) -> FormatMetadata;
}

/// LUKS version 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks1 {
    pub hash: String,
}

impl Luks1 {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}

impl Default for Luks1 {
    fn default() -> Self {
        Self::new(DEFAULT_HASH)
    }
}

impl FormatProfile for Luks1 {
    fn format_name(&self) -> &'static str {
        LUKS1
    }

    fn metadata(&self) -> FormatMetadata {
        FormatMetadata::Luks1 {
            hash: self.hash.clone(),
        }
    }
}

/// LUKS version 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks2 {
    pub hash: String,
    /// Encryption sector size in bytes.
    pub sector_size: u32,
    pub label: Option<String>,
}

impl Default for Luks2 {
    fn default() -> Self {
        Self {
            hash: DEFAULT_HASH.to_string(),
            sector_size: DEFAULT_LUKS2_SECTOR_SIZE,
            label: None,
        }
    }
}

impl FormatProfile for Luks2 {
    fn format_name(&self) -> &'static str {
        LUKS2
    }

    fn metadata(&self) -> FormatMetadata {
        FormatMetadata::Luks2 {
            hash: self.hash.clone(),
            sector_size: self.sector_size,
            label: self.label.clone(),
        }
    }
}
