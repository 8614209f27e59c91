#![forbid(unsafe_code)]

//! Engine contract shared across cryptvol.
//!
//! The device handle in `cryptvol-core` is written against [`VolumeEngine`] so it
//! never depends on how a concrete engine talks to the host.

pub mod engine;
pub mod flags;
pub mod params;

pub use engine::{MappingState, Status, VolumeEngine};
pub use flags::ActivationFlags;
pub use params::{FormatMetadata, GenericParams};

/// `-EPERM`
pub const EPERM: Status = -1;
/// `-ENOENT`
pub const ENOENT: Status = -2;
/// `-EIO`
pub const EIO: Status = -5;
/// `-ENOMEM`
pub const ENOMEM: Status = -12;
/// `-EACCES`
pub const EACCES: Status = -13;
/// `-ENOTBLK`: the path does not resolve to a usable device.
pub const ENOTBLK: Status = -15;
/// `-EBUSY`
pub const EBUSY: Status = -16;
/// `-EEXIST`
pub const EEXIST: Status = -17;
/// `-ENODEV`: the named mapping is not active.
pub const ENODEV: Status = -19;
/// `-EINVAL`: invalid argument, or the context is in the wrong state.
pub const EINVAL: Status = -22;
/// `-ENOSPC`
pub const ENOSPC: Status = -28;
/// `-ENOTSUP`
pub const ENOTSUP: Status = -95;
/// `-ETIMEDOUT`
pub const ETIMEDOUT: Status = -110;
