#![forbid(unsafe_code)]

//! `cryptsetup`-backed volume engine.
//!
//! Every engine operation maps onto one or two `cryptsetup` invocations. Secrets
//! travel over stdin or through private scratch files that are scrubbed on
//! release; exit codes are folded back into negative errno statuses.

mod command;
mod secret;
mod system;

pub use system::{CryptsetupContext, CryptsetupEngine};
