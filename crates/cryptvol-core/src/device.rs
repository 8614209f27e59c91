//! Device handle lifecycle.
//!
//! A [`Device`] owns exactly one native engine context. The context moves
//! through `Bound` (allocated, no format), `Typed` (format or load succeeded) and
//! `Active` (mapped under a name) until it is released by [`Device::free`] or
//! when the handle is dropped.
//!
//! Operations that need parsed header metadata go through a single guard so a
//! type-less handle fails with `-EINVAL` before the engine is consulted.

use crate::error::{check_status, CryptError, CryptResult};
use crate::profile::FormatProfile;
use cryptvol_provider::{
    ActivationFlags, GenericParams, MappingState, Status, VolumeEngine, EINVAL,
};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Observable lifecycle state of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Never bound to a device.
    Uninitialized,
    /// Context allocated, no recognized format.
    Bound,
    /// Format or load succeeded.
    Typed,
    /// At least one mapping activated through this handle is still up.
    Active,
    /// Context released.
    Freed,
}

/// Ownership of the native context.
///
/// `Unset` and `Released` are kept apart so that a never-initialised handle can
/// still report one successful [`Device::free`].
enum ContextSlot<C> {
    Unset,
    Held(C),
    Released,
}

/// Caller-facing handle over one native engine context.
///
/// A handle is not meant to be shared between threads; every mutating operation
/// takes `&mut self`. Distinct handles are independent.
pub struct Device<E: VolumeEngine> {
    engine: E,
    path: PathBuf,
    context: ContextSlot<E::Context>,
    active: BTreeSet<String>,
}

impl<E: VolumeEngine> Device<E> {
    /// Bind a new handle to the block device at `path`.
    ///
    /// Fails with the engine's code (`-ENOTBLK` when the path does not resolve to
    /// a usable device); no handle is produced in that case.
    pub fn init(engine: E, path: impl AsRef<Path>) -> CryptResult<Self> {
        let path = path.as_ref();
        debug!("initialising device handle for {}", path.display());
        let context = engine.init(path).map_err(|code| {
            warn!("engine rejected {} (code {code})", path.display());
            CryptError::from_status(code)
        })?;

        Ok(Self {
            engine,
            path: path.to_path_buf(),
            context: ContextSlot::Held(context),
            active: BTreeSet::new(),
        })
    }

    /// Device path this handle was bound to. Empty for a zero-value handle.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Engine backing this handle.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn state(&self) -> DeviceState {
        match &self.context {
            ContextSlot::Unset => DeviceState::Uninitialized,
            ContextSlot::Released => DeviceState::Freed,
            ContextSlot::Held(context) => {
                if self.engine.get_type(context).is_none() {
                    DeviceState::Bound
                } else if self.active.is_empty() {
                    DeviceState::Typed
                } else {
                    DeviceState::Active
                }
            }
        }
    }

    /// Format name of the loaded header, or an empty string when there is none.
    pub fn type_name(&self) -> String {
        match &self.context {
            ContextSlot::Held(context) => self.engine.get_type(context).unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Write a new header described by `profile` and `params`.
    ///
    /// Re-formatting a typed device is allowed and replaces the previous header.
    pub fn format<P>(&mut self, profile: &P, params: &GenericParams) -> CryptResult<()>
    where
        P: FormatProfile + ?Sized,
    {
        let format = profile.format_name();
        let metadata = profile.metadata();
        debug!(
            "formatting {} as {format} ({}, {} bit key)",
            self.path.display(),
            params.cipher_spec(),
            params.volume_key_bits()
        );
        let (engine, context) = self.live_context("format")?;
        let status = engine.format(context, format, &metadata, params);
        self.finish("format", status).map(drop)
    }

    /// Read an existing header described by `profile`. Volume data is untouched.
    pub fn load<P>(&mut self, profile: &P) -> CryptResult<()>
    where
        P: FormatProfile + ?Sized,
    {
        let format = profile.format_name();
        let metadata = profile.metadata();
        let (engine, context) = self.live_context("load")?;
        let status = engine.load(context, format, &metadata);
        self.finish("load", status).map(drop)
    }

    /// Activate the device as `name`, unlocking with a passphrase.
    ///
    /// Returns the keyslot that matched.
    pub fn activate_by_passphrase(
        &mut self,
        name: &str,
        keyslot: Option<u32>,
        passphrase: impl AsRef<[u8]>,
        flags: ActivationFlags,
    ) -> CryptResult<u32> {
        let (engine, context) = self.typed_context("activate by passphrase")?;
        let status =
            engine.activate_by_passphrase(context, name, keyslot, passphrase.as_ref(), flags);
        let slot = self.finish("activate by passphrase", status)?;
        self.active.insert(name.to_string());
        Ok(slot)
    }

    /// Activate the device as `name` using the raw volume key.
    pub fn activate_by_volume_key(
        &mut self,
        name: &str,
        volume_key: &[u8],
        volume_key_size: usize,
        flags: ActivationFlags,
    ) -> CryptResult<()> {
        let (engine, context) = self.typed_context("activate by volume key")?;
        let status =
            engine.activate_by_volume_key(context, name, volume_key, volume_key_size, flags);
        self.finish("activate by volume key", status)?;
        self.active.insert(name.to_string());
        Ok(())
    }

    /// Remove the mapping `name`. Fails with `-ENODEV` when it is not active.
    pub fn deactivate(&mut self, name: &str) -> CryptResult<()> {
        let (engine, context) = self.live_context("deactivate")?;
        let status = engine.deactivate(context, name);
        self.finish("deactivate", status)?;
        self.active.remove(name);
        Ok(())
    }

    /// Add a passphrase keyslot using the volume key.
    ///
    /// An empty `volume_key` asks the engine to use the key it still holds from
    /// a format on this handle. Returns the slot written.
    pub fn keyslot_add_by_volume_key(
        &mut self,
        keyslot: Option<u32>,
        volume_key: &[u8],
        passphrase: impl AsRef<[u8]>,
    ) -> CryptResult<u32> {
        let (engine, context) = self.typed_context("add keyslot by volume key")?;
        let status =
            engine.keyslot_add_by_volume_key(context, keyslot, volume_key, passphrase.as_ref());
        self.finish("add keyslot by volume key", status)
    }

    /// Add a keyslot for `new_passphrase`, authorised by an existing passphrase.
    pub fn keyslot_add_by_passphrase(
        &mut self,
        keyslot: Option<u32>,
        passphrase: impl AsRef<[u8]>,
        new_passphrase: impl AsRef<[u8]>,
    ) -> CryptResult<u32> {
        let (engine, context) = self.typed_context("add keyslot by passphrase")?;
        let status = engine.keyslot_add_by_passphrase(
            context,
            keyslot,
            passphrase.as_ref(),
            new_passphrase.as_ref(),
        );
        self.finish("add keyslot by passphrase", status)
    }

    /// Replace a passphrase. Returns the slot now holding `new_passphrase`.
    pub fn keyslot_change_by_passphrase(
        &mut self,
        keyslot_old: Option<u32>,
        keyslot_new: Option<u32>,
        passphrase: impl AsRef<[u8]>,
        new_passphrase: impl AsRef<[u8]>,
    ) -> CryptResult<u32> {
        let (engine, context) = self.typed_context("change keyslot by passphrase")?;
        let status = engine.keyslot_change_by_passphrase(
            context,
            keyslot_old,
            keyslot_new,
            passphrase.as_ref(),
            new_passphrase.as_ref(),
        );
        self.finish("change keyslot by passphrase", status)
    }

    /// Wipe `keyslot`.
    pub fn keyslot_destroy(&mut self, keyslot: u32) -> CryptResult<()> {
        let (engine, context) = self.typed_context("destroy keyslot")?;
        let status = engine.keyslot_destroy(context, keyslot);
        self.finish("destroy keyslot", status).map(drop)
    }

    /// Kernel state of the mapping `name`.
    pub fn status(&self, name: &str) -> CryptResult<MappingState> {
        match &self.context {
            ContextSlot::Held(context) => Ok(self.engine.status(context, name)),
            _ => Err(self.missing_context("status")),
        }
    }

    /// Print header metadata through the engine.
    ///
    /// Returns `0` for a typed handle. A handle without a recognized type or
    /// without a live context reports `-EINVAL`.
    pub fn dump(&self) -> Status {
        let ContextSlot::Held(context) = &self.context else {
            return EINVAL;
        };
        if self.engine.get_type(context).is_none() {
            return EINVAL;
        }
        self.engine.dump(context)
    }

    /// Release the native context.
    ///
    /// The first call on a handle returns `true`, whether or not it ever held a
    /// context; later calls return `false`.
    pub fn free(&mut self) -> bool {
        match std::mem::replace(&mut self.context, ContextSlot::Released) {
            ContextSlot::Held(context) => {
                debug!("releasing context for {}", self.path.display());
                self.engine.free(context);
                self.active.clear();
                true
            }
            ContextSlot::Unset => true,
            ContextSlot::Released => false,
        }
    }

    fn live_context(&mut self, operation: &str) -> CryptResult<(&E, &mut E::Context)> {
        match &mut self.context {
            ContextSlot::Held(context) => Ok((&self.engine, context)),
            ContextSlot::Unset => Err(CryptError::invalid_state(format!(
                "cannot {operation}: device handle was never initialised"
            ))),
            ContextSlot::Released => Err(CryptError::invalid_state(format!(
                "cannot {operation}: device handle has been freed"
            ))),
        }
    }

    fn typed_context(&mut self, operation: &str) -> CryptResult<(&E, &mut E::Context)> {
        let path = self.path.display().to_string();
        let (engine, context) = self.live_context(operation)?;
        if engine.get_type(context).is_none() {
            return Err(CryptError::invalid_state(format!(
                "cannot {operation}: {path} has no recognized format; format or load it first"
            )));
        }
        Ok((engine, context))
    }

    fn missing_context(&self, operation: &str) -> CryptError {
        let reason = match self.context {
            ContextSlot::Released => "has been freed",
            _ => "was never initialised",
        };
        CryptError::invalid_state(format!("cannot {operation}: device handle {reason}"))
    }

    fn finish(&self, operation: &str, status: Status) -> CryptResult<u32> {
        check_status(status).map_err(|err| {
            warn!("{operation} failed for {}: {err}", self.path.display());
            err
        })
    }
}

impl<E: VolumeEngine + Default> Default for Device<E> {
    /// Zero-value handle: no device, no context.
    fn default() -> Self {
        Self {
            engine: E::default(),
            path: PathBuf::new(),
            context: ContextSlot::Unset,
            active: BTreeSet::new(),
        }
    }
}

impl<E: VolumeEngine> Drop for Device<E> {
    fn drop(&mut self) {
        if let ContextSlot::Held(context) =
            std::mem::replace(&mut self.context, ContextSlot::Released)
        {
            debug!("releasing context for {} on drop", self.path.display());
            self.engine.free(context);
        }
    }
}

impl<E: VolumeEngine> fmt::Debug for Device<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("type", &self.type_name())
            .field("active", &self.active)
            .finish()
    }
}
