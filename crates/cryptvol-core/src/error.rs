//! Error types and status translation.

use cryptvol_provider::{
    Status, EACCES, EBUSY, EEXIST, EINVAL, EIO, ENODEV, ENOENT, ENOMEM, ENOSPC, ENOTBLK, ENOTSUP,
    EPERM, ETIMEDOUT,
};
use thiserror::Error;

pub type CryptResult<T> = Result<T, CryptError>;

/// Failure reported by a device operation.
///
/// Engine-derived variants keep the exact status code. Callers that need more
/// detail than the variant gives should branch on [`CryptError::code`].
#[derive(Debug, Error)]
pub enum CryptError {
    #[error("device not found (code {code}): {message}")]
    NotFound { code: Status, message: String },
    #[error("invalid argument or device state (code {code}): {message}")]
    InvalidState { code: Status, message: String },
    #[error("device not active (code {code}): {message}")]
    NotActive { code: Status, message: String },
    #[error("engine failure (code {code}): {message}")]
    Engine { code: Status, message: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl CryptError {
    /// Build the typed error for a negative engine status.
    pub fn from_status(code: Status) -> Self {
        let message = describe_status(code);
        match code {
            ENOTBLK => CryptError::NotFound { code, message },
            EINVAL => CryptError::InvalidState { code, message },
            ENODEV => CryptError::NotActive { code, message },
            _ => CryptError::Engine { code, message },
        }
    }

    /// Failure for an operation attempted on a handle without a usable context
    /// or recognized type.
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        CryptError::InvalidState {
            code: EINVAL,
            message: message.into(),
        }
    }

    /// Status code carried by this error.
    pub fn code(&self) -> Status {
        match self {
            CryptError::NotFound { code, .. }
            | CryptError::InvalidState { code, .. }
            | CryptError::NotActive { code, .. }
            | CryptError::Engine { code, .. } => *code,
            CryptError::Io(err) => err.raw_os_error().map(|errno| -errno).unwrap_or(EIO),
            CryptError::InvalidConfig(_) | CryptError::Toml(_) | CryptError::Yaml(_) => EINVAL,
        }
    }
}

/// Translate a raw engine status into a result.
///
/// Non-negative values are success and are passed through (keyslot operations
/// report the slot they used). Negative values become a [`CryptError`] carrying
/// the same code.
pub fn check_status(status: Status) -> CryptResult<u32> {
    if status < 0 {
        Err(CryptError::from_status(status))
    } else {
        Ok(status.unsigned_abs())
    }
}

fn describe_status(code: Status) -> String {
    let text = match code {
        EPERM => "operation not permitted (wrong passphrase or insufficient privileges)",
        ENOENT => "no such file, keyslot, or token",
        EIO => "input/output error on the underlying device",
        ENOMEM => "out of memory",
        EACCES => "permission denied",
        ENOTBLK => "device does not exist or is not a usable block device",
        EBUSY => "device or mapping is busy",
        EEXIST => "mapping or keyslot already exists",
        ENODEV => "no such device or mapping is not active",
        EINVAL => "invalid argument or operation not allowed in the current device state",
        ENOSPC => "no free keyslot or space left on device",
        ENOTSUP => "operation not supported by this format",
        ETIMEDOUT => "engine call timed out",
        _ => return std::io::Error::from_raw_os_error(code.saturating_neg()).to_string(),
    };
    text.to_string()
}
