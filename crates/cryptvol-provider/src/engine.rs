//! Call contract for volume-management engines.
//!
//! An engine owns the cryptographic and on-disk format work. Callers only see an
//! opaque [`VolumeEngine::Context`] and integer status codes: zero or positive on
//! success, a negated errno on failure.

use crate::flags::ActivationFlags;
use crate::params::{FormatMetadata, GenericParams};
use std::path::Path;

/// Raw status returned by every engine call.
pub type Status = i32;

/// Kernel-level state of a named mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Inactive,
    Active,
    /// Active and held open by another user.
    Busy,
    /// The engine could not determine the state.
    Invalid,
}

/// Abstraction over a volume-management engine.
///
/// Every method except [`VolumeEngine::init`] and [`VolumeEngine::free`] maps to
/// exactly one engine operation and reports its raw status. Keyslot arguments
/// use `None` for "any free slot".
pub trait VolumeEngine {
    /// Native context bound to a single block device.
    type Context;

    /// Allocate a context for the device at `device`.
    fn init(&self, device: &Path) -> Result<Self::Context, Status>;

    /// Write a fresh header of type `format` and adopt `params`.
    fn format(
        &self,
        context: &mut Self::Context,
        format: &str,
        metadata: &FormatMetadata,
        params: &GenericParams,
    ) -> Status;

    /// Read an existing header of type `format` into the context.
    fn load(&self, context: &mut Self::Context, format: &str, metadata: &FormatMetadata)
        -> Status;

    /// Map the device under `name`, unlocking it with `passphrase`.
    ///
    /// Returns the keyslot that opened on success.
    fn activate_by_passphrase(
        &self,
        context: &mut Self::Context,
        name: &str,
        keyslot: Option<u32>,
        passphrase: &[u8],
        flags: ActivationFlags,
    ) -> Status;

    /// Map the device under `name` using the raw volume key.
    fn activate_by_volume_key(
        &self,
        context: &mut Self::Context,
        name: &str,
        volume_key: &[u8],
        volume_key_size: usize,
        flags: ActivationFlags,
    ) -> Status;

    /// Remove the mapping called `name`.
    fn deactivate(&self, context: &mut Self::Context, name: &str) -> Status;

    /// Add a passphrase keyslot. An empty `volume_key` selects the key cached
    /// in the context by a preceding format.
    fn keyslot_add_by_volume_key(
        &self,
        context: &mut Self::Context,
        keyslot: Option<u32>,
        volume_key: &[u8],
        passphrase: &[u8],
    ) -> Status;

    /// Add a keyslot for `new_passphrase`, authorised by `passphrase`.
    fn keyslot_add_by_passphrase(
        &self,
        context: &mut Self::Context,
        keyslot: Option<u32>,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Status;

    /// Replace the passphrase in `keyslot_old`, storing the result in `keyslot_new`.
    fn keyslot_change_by_passphrase(
        &self,
        context: &mut Self::Context,
        keyslot_old: Option<u32>,
        keyslot_new: Option<u32>,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Status;

    /// Wipe a single keyslot.
    fn keyslot_destroy(&self, context: &mut Self::Context, keyslot: u32) -> Status;

    /// Report the kernel state of the mapping called `name`.
    fn status(&self, context: &Self::Context, name: &str) -> MappingState;

    /// Print header metadata. Returns 0 when the context has a recognized type.
    fn dump(&self, context: &Self::Context) -> Status;

    /// Name of the on-disk format held by the context, if any.
    fn get_type(&self, context: &Self::Context) -> Option<String>;

    /// Release the context. This is the single release point.
    fn free(&self, context: Self::Context);
}
