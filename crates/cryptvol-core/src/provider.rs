//! Engine contract used by the device handle.
//!
//! Concrete engines live in crates such as `cryptvol-cryptsetup`. The shared
//! types are sourced from `cryptvol-provider` so downstream users only need to
//! depend on this crate.

pub use cryptvol_provider::engine::{MappingState, Status, VolumeEngine};
pub use cryptvol_provider::flags::ActivationFlags;
pub use cryptvol_provider::params::{FormatMetadata, GenericParams};
pub use cryptvol_provider::{EBUSY, EINVAL, EIO, ENODEV, ENOTBLK, EPERM, ETIMEDOUT};
