//! Configuration model used to build engines and default format parameters.

use crate::error::{CryptError, CryptResult};
use crate::profile::{Luks1, DEFAULT_HASH};
use cryptvol_provider::params::{DEFAULT_CIPHER, DEFAULT_CIPHER_MODE, DEFAULT_VOLUME_KEY_SIZE};
use cryptvol_provider::GenericParams;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptvol.toml";

/// Settings for the engine that backs device handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCfg {
    /// Explicit `cryptsetup` binary; resolved from well-known locations when unset.
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Defaults applied when formatting without explicit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatCfg {
    #[serde(default = "default_cipher")]
    pub cipher: String,

    #[serde(default = "default_cipher_mode")]
    pub cipher_mode: String,

    #[serde(default = "default_volume_key_bits")]
    pub volume_key_bits: usize,

    #[serde(default = "default_hash")]
    pub hash: String,
}

fn default_cipher() -> String {
    DEFAULT_CIPHER.to_string()
}

fn default_cipher_mode() -> String {
    DEFAULT_CIPHER_MODE.to_string()
}

fn default_volume_key_bits() -> usize {
    DEFAULT_VOLUME_KEY_SIZE * 8
}

fn default_hash() -> String {
    DEFAULT_HASH.to_string()
}

impl Default for FormatCfg {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            cipher_mode: default_cipher_mode(),
            volume_key_bits: default_volume_key_bits(),
            hash: default_hash(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptvolConfig {
    #[serde(default)]
    pub engine: EngineCfg,

    #[serde(default)]
    pub format: FormatCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub config_format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl CryptvolConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read a config file from disk, detect format, and reject unusable values.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.config_format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(CryptError::InvalidConfig(issues.join("; ")));
        }

        debug!("loaded configuration from {}", path.display());
        Ok(cfg)
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.engine.timeout_secs == 0 {
            issues.push("engine.timeout_secs must be greater than zero".to_string());
        }

        if let Some(path) = &self.engine.cryptsetup_path {
            if path.trim().is_empty() {
                issues.push("engine.cryptsetup_path is set but empty".to_string());
            }
        }

        if self.format.cipher.trim().is_empty() {
            issues.push("format.cipher must not be empty".to_string());
        }

        if self.format.hash.trim().is_empty() {
            issues.push("format.hash must not be empty".to_string());
        }

        let bits = self.format.volume_key_bits;
        if bits == 0 || bits % 8 != 0 {
            issues.push(format!(
                "format.volume_key_bits must be a positive multiple of 8 (got {bits})"
            ));
        }

        issues
    }

    /// Upper bound for a single engine call.
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout_secs.max(1))
    }

    /// Generic parameters built from the `[format]` section.
    pub fn generic_params(&self) -> GenericParams {
        GenericParams::new(
            self.format.cipher.trim(),
            self.format.cipher_mode.trim(),
            self.format.volume_key_bits / 8,
        )
    }

    /// LUKS1 profile built from the `[format]` section.
    pub fn luks1_profile(&self) -> Luks1 {
        Luks1::new(self.format.hash.trim())
    }
}
