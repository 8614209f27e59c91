//! System-backed `VolumeEngine` implementation.
//!
//! Drives the host `cryptsetup` binary. The native context is the device path
//! plus what this process learned about it: the header type established by
//! format or load, and the volume key when this context created the header.

use crate::command::{io_status, CryptsetupCommand, Output};
use crate::secret::SecretFile;
use cryptvol_core::config::CryptvolConfig;
use cryptvol_core::error::{CryptError, CryptResult};
use cryptvol_core::provider::{
    ActivationFlags, FormatMetadata, GenericParams, MappingState, Status, VolumeEngine, EINVAL,
    EIO, ENOTBLK,
};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

/// Slot used for the passphrase `luksFormat` insists on; wiped right after.
const FORMAT_KEYSLOT: u32 = 0;
const THROWAWAY_PASSPHRASE_BYTES: usize = 32;

/// Engine that manages LUKS devices via the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct CryptsetupEngine {
    cryptsetup: CryptsetupCommand,
}

/// Native context for [`CryptsetupEngine`].
pub struct CryptsetupContext {
    device: PathBuf,
    header: Option<HeaderKind>,
    volume_key: Option<Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for CryptsetupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptsetupContext")
            .field("device", &self.device)
            .field("header", &self.header)
            .field("volume_key", &self.volume_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderKind {
    Luks1,
    Luks2,
}

impl HeaderKind {
    fn from_format(format: &str) -> Option<Self> {
        match format {
            "LUKS1" => Some(Self::Luks1),
            "LUKS2" => Some(Self::Luks2),
            _ => None,
        }
    }

    /// Resolve the header kind, rejecting metadata that belongs to another format.
    fn resolve(format: &str, metadata: &FormatMetadata) -> Option<Self> {
        let kind = Self::from_format(format)?;
        match (kind, metadata) {
            (Self::Luks1, FormatMetadata::Luks1 { .. })
            | (Self::Luks2, FormatMetadata::Luks2 { .. }) => Some(kind),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Luks1 => "LUKS1",
            Self::Luks2 => "LUKS2",
        }
    }

    fn cli_type(self) -> &'static str {
        match self {
            Self::Luks1 => "luks1",
            Self::Luks2 => "luks2",
        }
    }
}

impl CryptsetupEngine {
    /// Build an engine from configuration, resolving the `cryptsetup` binary.
    pub fn from_config(config: &CryptvolConfig) -> CryptResult<Self> {
        let binary = resolve_cryptsetup_path(config)?;
        debug!("using cryptsetup at {}", binary.display());
        Ok(Self::with_binary(binary, config.engine_timeout()))
    }

    /// Build an engine around an explicit binary.
    pub fn with_binary(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cryptsetup: CryptsetupCommand::new(binary.into(), timeout),
        }
    }

    pub fn binary(&self) -> &Path {
        self.cryptsetup.binary()
    }

    /// Passphrase activation and keyslot updates share this shape: secret on
    /// stdin, verbose output parsed for the keyslot that was used.
    fn run_keyslot_action(
        &self,
        args: Vec<OsString>,
        input: &[u8],
        fallback_slot: Option<u32>,
    ) -> Status {
        let out = match self.cryptsetup.run(args, Some(input)) {
            Ok(out) => out,
            Err(code) => return code,
        };
        let status = out.status();
        if status < 0 {
            return status;
        }
        reported_slot(&out, fallback_slot)
    }
}

impl VolumeEngine for CryptsetupEngine {
    type Context = CryptsetupContext;

    fn init(&self, device: &Path) -> Result<CryptsetupContext, Status> {
        let meta = match fs::metadata(device) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ENOTBLK),
            Err(err) => return Err(io_status(&err)),
        };
        if !(meta.file_type().is_block_device() || meta.is_file()) {
            return Err(ENOTBLK);
        }
        File::open(device).map_err(|err| io_status(&err))?;

        Ok(CryptsetupContext {
            device: device.to_path_buf(),
            header: None,
            volume_key: None,
        })
    }

    fn format(
        &self,
        context: &mut CryptsetupContext,
        format: &str,
        metadata: &FormatMetadata,
        params: &GenericParams,
    ) -> Status {
        let Some(kind) = HeaderKind::resolve(format, metadata) else {
            return EINVAL;
        };
        if params.volume_key_size == 0 {
            return EINVAL;
        }
        let volume_key = match &params.volume_key {
            Some(key) if key.len() != params.volume_key_size => return EINVAL,
            Some(key) => key.clone(),
            None => random_bytes(params.volume_key_size),
        };
        let key_file = match SecretFile::new(&volume_key) {
            Ok(file) => file,
            Err(err) => return io_status(&err),
        };
        let passphrase = Zeroizing::new(hex::encode(&*random_bytes(THROWAWAY_PASSPHRASE_BYTES)));

        let mut args = os_args([
            "luksFormat",
            "--batch-mode",
            "--type",
            kind.cli_type(),
            "--cipher",
            &params.cipher_spec(),
            "--key-size",
            &params.volume_key_bits().to_string(),
            "--hash",
            metadata.hash(),
            "--key-slot",
            &FORMAT_KEYSLOT.to_string(),
            "--key-file",
            "-",
        ]);
        args.push("--volume-key-file".into());
        args.push(key_file.path().into());
        if let FormatMetadata::Luks2 {
            sector_size, label, ..
        } = metadata
        {
            args.push("--sector-size".into());
            args.push(sector_size.to_string().into());
            if let Some(label) = label {
                args.push("--label".into());
                args.push(label.into());
            }
        }
        args.push(context.device.clone().into());

        let status = self
            .cryptsetup
            .status(args, Some(passphrase.as_bytes()));
        if status < 0 {
            return status;
        }

        // The header on disk is now the new one even if the wipe below fails.
        context.header = Some(kind);
        context.volume_key = Some(volume_key);

        let status = self.cryptsetup.status(
            [
                OsString::from("luksKillSlot"),
                "--batch-mode".into(),
                context.device.clone().into(),
                FORMAT_KEYSLOT.to_string().into(),
            ],
            None,
        );
        if status < 0 {
            warn!(
                "header written to {} but keyslot {FORMAT_KEYSLOT} could not be wiped",
                context.device.display()
            );
            return status;
        }
        0
    }

    fn load(
        &self,
        context: &mut CryptsetupContext,
        format: &str,
        metadata: &FormatMetadata,
    ) -> Status {
        let Some(kind) = HeaderKind::resolve(format, metadata) else {
            return EINVAL;
        };
        let status = self.cryptsetup.status(
            [
                OsString::from("isLuks"),
                "--type".into(),
                kind.cli_type().into(),
                context.device.clone().into(),
            ],
            None,
        );
        if status < 0 {
            return status;
        }

        if context.header != Some(kind) {
            context.volume_key = None;
        }
        context.header = Some(kind);
        0
    }

    fn activate_by_passphrase(
        &self,
        context: &mut CryptsetupContext,
        name: &str,
        keyslot: Option<u32>,
        passphrase: &[u8],
        flags: ActivationFlags,
    ) -> Status {
        let Some(kind) = context.header else {
            return EINVAL;
        };
        let mut args = os_args([
            "open",
            "--type",
            kind.cli_type(),
            "--batch-mode",
            "--verbose",
            "--key-file",
            "-",
        ]);
        push_keyslot(&mut args, keyslot);
        args.extend(flag_args(flags));
        args.push(context.device.clone().into());
        args.push(name.into());

        self.run_keyslot_action(args, passphrase, keyslot)
    }

    fn activate_by_volume_key(
        &self,
        context: &mut CryptsetupContext,
        name: &str,
        volume_key: &[u8],
        volume_key_size: usize,
        flags: ActivationFlags,
    ) -> Status {
        let Some(kind) = context.header else {
            return EINVAL;
        };
        if volume_key.is_empty() || volume_key.len() != volume_key_size {
            return EINVAL;
        }
        let key_file = match SecretFile::new(volume_key) {
            Ok(file) => file,
            Err(err) => return io_status(&err),
        };

        let mut args = os_args(["open", "--type", kind.cli_type(), "--batch-mode"]);
        args.push("--volume-key-file".into());
        args.push(key_file.path().into());
        args.extend(flag_args(flags));
        args.push(context.device.clone().into());
        args.push(name.into());

        self.cryptsetup.status(args, None)
    }

    fn deactivate(&self, _context: &mut CryptsetupContext, name: &str) -> Status {
        let out = match self.cryptsetup.run(["close", name], None) {
            Ok(out) if out.exit_code != 0 && action_unsupported(&out.diagnostic()) => {
                self.cryptsetup.run(["luksClose", name], None)
            }
            other => other,
        };
        match out {
            Ok(out) => out.status(),
            Err(code) => code,
        }
    }

    fn keyslot_add_by_volume_key(
        &self,
        context: &mut CryptsetupContext,
        keyslot: Option<u32>,
        volume_key: &[u8],
        passphrase: &[u8],
    ) -> Status {
        let key_file = if volume_key.is_empty() {
            match &context.volume_key {
                Some(cached) => SecretFile::new(cached),
                None => return EINVAL,
            }
        } else {
            SecretFile::new(volume_key)
        };
        let key_file = match key_file {
            Ok(file) => file,
            Err(err) => return io_status(&err),
        };
        let new_key_file = match SecretFile::new(passphrase) {
            Ok(file) => file,
            Err(err) => return io_status(&err),
        };

        let mut args = os_args(["luksAddKey", "--batch-mode", "--verbose"]);
        args.push("--volume-key-file".into());
        args.push(key_file.path().into());
        push_keyslot(&mut args, keyslot);
        args.push(context.device.clone().into());
        args.push(new_key_file.path().into());

        let out = match self.cryptsetup.run(args, None) {
            Ok(out) => out,
            Err(code) => return code,
        };
        match out.status() {
            status if status < 0 => status,
            _ => reported_slot(&out, keyslot),
        }
    }

    fn keyslot_add_by_passphrase(
        &self,
        context: &mut CryptsetupContext,
        keyslot: Option<u32>,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Status {
        let new_key_file = match SecretFile::new(new_passphrase) {
            Ok(file) => file,
            Err(err) => return io_status(&err),
        };

        let mut args = os_args(["luksAddKey", "--batch-mode", "--verbose", "--key-file", "-"]);
        push_keyslot(&mut args, keyslot);
        args.push(context.device.clone().into());
        args.push(new_key_file.path().into());

        self.run_keyslot_action(args, passphrase, keyslot)
    }

    fn keyslot_change_by_passphrase(
        &self,
        context: &mut CryptsetupContext,
        keyslot_old: Option<u32>,
        keyslot_new: Option<u32>,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Status {
        let relocate = matches!((keyslot_old, keyslot_new), (_, Some(new)) if keyslot_old != Some(new));
        if !relocate {
            let new_key_file = match SecretFile::new(new_passphrase) {
                Ok(file) => file,
                Err(err) => return io_status(&err),
            };
            let mut args = os_args([
                "luksChangeKey",
                "--batch-mode",
                "--verbose",
                "--key-file",
                "-",
            ]);
            push_keyslot(&mut args, keyslot_old);
            args.push(context.device.clone().into());
            args.push(new_key_file.path().into());
            return self.run_keyslot_action(args, passphrase, keyslot_old);
        }

        // luksChangeKey cannot pick the destination slot: find the old slot,
        // add the new passphrase where requested, then wipe the old slot.
        let mut probe = os_args(["open", "--test-passphrase", "--verbose", "--key-file", "-"]);
        push_keyslot(&mut probe, keyslot_old);
        probe.push(context.device.clone().into());
        let old = self.run_keyslot_action(probe, passphrase, keyslot_old);
        if old < 0 {
            return old;
        }

        let new = self.keyslot_add_by_passphrase(context, keyslot_new, passphrase, new_passphrase);
        if new < 0 {
            return new;
        }
        if new != old {
            let status = self.keyslot_destroy(context, old.unsigned_abs());
            if status < 0 {
                return status;
            }
        }
        new
    }

    fn keyslot_destroy(&self, context: &mut CryptsetupContext, keyslot: u32) -> Status {
        self.cryptsetup.status(
            [
                OsString::from("luksKillSlot"),
                "--batch-mode".into(),
                context.device.clone().into(),
                keyslot.to_string().into(),
            ],
            None,
        )
    }

    fn status(&self, _context: &CryptsetupContext, name: &str) -> MappingState {
        match self.cryptsetup.run(["status", name], None) {
            Ok(out) => classify_status(name, out.exit_code, &out.stdout, &out.diagnostic()),
            Err(code) => {
                warn!("cryptsetup status {name} failed to run (code {code})");
                MappingState::Invalid
            }
        }
    }

    fn dump(&self, context: &CryptsetupContext) -> Status {
        if context.header.is_none() {
            return EINVAL;
        }
        let out = match self
            .cryptsetup
            .run([OsString::from("luksDump"), context.device.clone().into()], None)
        {
            Ok(out) => out,
            Err(code) => return code,
        };
        let status = out.status();
        if status == 0 {
            for line in out.stdout.lines() {
                info!("{line}");
            }
        }
        status
    }

    fn get_type(&self, context: &CryptsetupContext) -> Option<String> {
        context.header.map(|kind| kind.name().to_string())
    }

    fn free(&self, context: CryptsetupContext) {
        debug!("releasing cryptsetup context for {}", context.device.display());
    }
}

fn os_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

fn push_keyslot(args: &mut Vec<OsString>, keyslot: Option<u32>) {
    if let Some(slot) = keyslot {
        args.push("--key-slot".into());
        args.push(slot.to_string().into());
    }
}

/// Command-line switches for the flags `cryptsetup open` can express.
fn flag_args(flags: ActivationFlags) -> Vec<OsString> {
    const SWITCHES: &[(ActivationFlags, &str)] = &[
        (ActivationFlags::READONLY, "--readonly"),
        (ActivationFlags::SHARED, "--shared"),
        (ActivationFlags::ALLOW_DISCARDS, "--allow-discards"),
        (ActivationFlags::SAME_CPU_CRYPT, "--perf-same_cpu_crypt"),
        (
            ActivationFlags::SUBMIT_FROM_CRYPT_CPUS,
            "--perf-submit_from_crypt_cpus",
        ),
    ];

    let mut remaining = flags;
    let mut args = Vec::new();
    for (flag, switch) in SWITCHES {
        if flags.contains(*flag) {
            args.push(OsString::from(switch));
            remaining.remove(*flag);
        }
    }
    if !remaining.is_empty() {
        debug!(
            "activation flags {:#x} have no cryptsetup switch; ignored",
            remaining.bits()
        );
    }
    args
}

/// Slot named by the verbose output, else the slot the caller asked for.
fn reported_slot(out: &Output, requested: Option<u32>) -> Status {
    match out.keyslot().or(requested) {
        Some(slot) => slot_status(slot),
        None => {
            warn!("cryptsetup succeeded without reporting a keyslot");
            EIO
        }
    }
}

fn slot_status(slot: u32) -> Status {
    Status::try_from(slot).unwrap_or(EINVAL)
}

fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn action_unsupported(diagnostic: &str) -> bool {
    let diagnostic_lower = diagnostic.to_ascii_lowercase();
    diagnostic_lower.contains("unknown action")
        || diagnostic_lower.contains("unknown command")
        || diagnostic_lower.contains("invalid action")
}

fn classify_status(name: &str, exit_code: i32, stdout: &str, diagnostic: &str) -> MappingState {
    let lower = diagnostic.to_ascii_lowercase();
    match exit_code {
        0 if stdout.to_ascii_lowercase().contains("in use") => MappingState::Busy,
        0 => MappingState::Active,
        4 => MappingState::Inactive,
        _ if lower.contains("is inactive")
            || lower.contains("not active")
            || lower.contains("does not exist") =>
        {
            MappingState::Inactive
        }
        _ => {
            warn!("cryptsetup status {name} exited with code {exit_code}: {diagnostic}");
            MappingState::Invalid
        }
    }
}

fn resolve_cryptsetup_path(config: &CryptvolConfig) -> CryptResult<PathBuf> {
    if let Some(path) = config
        .engine
        .cryptsetup_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(CryptError::InvalidConfig(format!(
                "cryptsetup binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in DEFAULT_CRYPTSETUP_PATHS {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    find_in_path("cryptsetup").ok_or_else(|| {
        CryptError::InvalidConfig(format!(
            "unable to locate cryptsetup binary; tried {:?} and PATH",
            DEFAULT_CRYPTSETUP_PATHS
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
