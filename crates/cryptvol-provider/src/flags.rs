//! Activation flag set.

use bitflags::bitflags;

bitflags! {
    /// Flags passed through to the engine on activation.
    ///
    /// Values match the engine's bit positions. Bits without a named constant are
    /// kept as-is so callers can pass engine flags this crate does not know about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActivationFlags: u32 {
        const READONLY = 1 << 0;
        const NO_UUID = 1 << 1;
        const SHARED = 1 << 2;
        const ALLOW_DISCARDS = 1 << 3;
        const PRIVATE = 1 << 4;
        const CORRUPTED = 1 << 5;
        const SAME_CPU_CRYPT = 1 << 6;
        const SUBMIT_FROM_CRYPT_CPUS = 1 << 7;

        const _ = !0;
    }
}
