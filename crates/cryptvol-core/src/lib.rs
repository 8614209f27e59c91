//! Device handle lifecycle over an external volume-management engine.
//!
//! [`Device`] owns one native engine context and enforces the operation order
//! (format or load before activation and keyslot management). Engine status
//! codes come back as [`CryptError`] values that keep the original code.

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod profile;
pub mod provider;

pub use config::{ConfigFormat, CryptvolConfig, EngineCfg, FormatCfg};
pub use device::{Device, DeviceState};
pub use error::{check_status, CryptError, CryptResult};
pub use profile::{FormatProfile, Luks1, Luks2};
pub use provider::{
    ActivationFlags, FormatMetadata, GenericParams, MappingState, Status, VolumeEngine,
};
