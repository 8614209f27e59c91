//! Value objects carried into format and key-based activation calls.

use std::fmt;
use zeroize::Zeroizing;

pub const DEFAULT_CIPHER: &str = "aes";
pub const DEFAULT_CIPHER_MODE: &str = "xts-plain64";
/// 512-bit key, as used by aes-xts.
pub const DEFAULT_VOLUME_KEY_SIZE: usize = 512 / 8;

/// Cipher selection and optional volume key material.
///
/// The relationship between `volume_key` and `volume_key_size` is not checked
/// here; the engine is the single point that rejects a mismatch.
#[derive(Clone, PartialEq, Eq)]
pub struct GenericParams {
    pub cipher: String,
    pub cipher_mode: String,
    pub volume_key: Option<Zeroizing<Vec<u8>>>,
    /// Volume key length in bytes.
    pub volume_key_size: usize,
}

impl GenericParams {
    pub fn new(
        cipher: impl Into<String>,
        cipher_mode: impl Into<String>,
        volume_key_size: usize,
    ) -> Self {
        Self {
            cipher: cipher.into(),
            cipher_mode: cipher_mode.into(),
            volume_key: None,
            volume_key_size,
        }
    }

    /// Attach explicit volume key material.
    pub fn with_volume_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.volume_key = Some(Zeroizing::new(key.into()));
        self
    }

    /// Combined cipher specification, e.g. `aes-xts-plain64`.
    pub fn cipher_spec(&self) -> String {
        if self.cipher_mode.is_empty() {
            self.cipher.clone()
        } else {
            format!("{}-{}", self.cipher, self.cipher_mode)
        }
    }

    /// Volume key size in bits.
    pub fn volume_key_bits(&self) -> usize {
        self.volume_key_size * 8
    }
}

impl Default for GenericParams {
    fn default() -> Self {
        Self::new(DEFAULT_CIPHER, DEFAULT_CIPHER_MODE, DEFAULT_VOLUME_KEY_SIZE)
    }
}

impl fmt::Debug for GenericParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericParams")
            .field("cipher", &self.cipher)
            .field("cipher_mode", &self.cipher_mode)
            .field("volume_key", &self.volume_key.as_ref().map(|_| "<redacted>"))
            .field("volume_key_size", &self.volume_key_size)
            .finish()
    }
}

/// Format-specific metadata handed to the engine on format and load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatMetadata {
    Luks1 {
        hash: String,
    },
    Luks2 {
        hash: String,
        sector_size: u32,
        label: Option<String>,
    },
}

impl FormatMetadata {
    /// Digest algorithm used for key derivation.
    pub fn hash(&self) -> &str {
        match self {
            FormatMetadata::Luks1 { hash } | FormatMetadata::Luks2 { hash, .. } => hash,
        }
    }
}
