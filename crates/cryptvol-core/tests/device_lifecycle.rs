use cryptvol_core::error::{CryptError, CryptResult};
use cryptvol_core::profile::{Luks1, Luks2};
use cryptvol_core::provider::{
    ActivationFlags, FormatMetadata, GenericParams, MappingState, Status, VolumeEngine,
};
use cryptvol_core::{Device, DeviceState};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const MAGIC: &str = "MOCKCRYPT\n";
const MAX_KEYSLOTS: u32 = 8;
const SUPPORTED_CIPHERS: &[&str] = &["aes", "serpent", "twofish"];

#[test]
fn init_fails_with_not_found_for_missing_device() {
    let err = Device::init(FileEngine::default(), "nonExistingDevicePath").unwrap_err();
    assert!(matches!(err, CryptError::NotFound { .. }), "{err:?}");
    assert_eq!(err.code(), -15);
}

#[test]
fn fresh_handle_is_bound_without_type() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let device = disk.open()?;

    assert_eq!(device.type_name(), "");
    assert_eq!(device.state(), DeviceState::Bound);
    assert!(device.dump() < 0);
    assert_eq!(device.path(), disk.path());
    Ok(())
}

#[test]
fn format_writes_header_and_sets_type() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;

    let before = disk.digest()?;
    device.format(&Luks1::default(), &GenericParams::default())?;
    let after = disk.digest()?;

    assert_ne!(before, after);
    assert_eq!(device.type_name(), "LUKS1");
    assert_eq!(device.state(), DeviceState::Typed);
    assert_eq!(device.dump(), 0);
    Ok(())
}

#[test]
fn load_after_format_keeps_type() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    let luks1 = Luks1::default();

    device.format(&luks1, &GenericParams::default())?;
    device.load(&luks1)?;
    assert_eq!(device.type_name(), "LUKS1");

    let mut reopened = disk.open()?;
    assert_eq!(reopened.type_name(), "");
    reopened.load(&luks1)?;
    assert_eq!(reopened.type_name(), "LUKS1");
    Ok(())
}

#[test]
fn load_without_header_fails() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;

    let err = device.load(&Luks1::default()).unwrap_err();
    assert!(err.code() < 0);
    assert_eq!(device.type_name(), "");
    Ok(())
}

#[test]
fn reformat_supersedes_previous_header() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;

    device.format(&Luks1::default(), &GenericParams::default())?;
    device.keyslot_add_by_volume_key(None, &[], "first")?;

    let luks2 = Luks2 {
        label: Some("scratch".into()),
        ..Luks2::default()
    };
    device.format(&luks2, &GenericParams::new("serpent", "xts-plain64", 32))?;
    assert_eq!(device.type_name(), "LUKS2");
    assert_eq!(device.dump(), 0);

    let err = device
        .activate_by_passphrase("vault", None, "first", ActivationFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), -1);

    let mut reopened = disk.open()?;
    assert!(reopened.load(&Luks1::default()).is_err());
    reopened.load(&luks2)?;
    assert_eq!(reopened.type_name(), "LUKS2");
    Ok(())
}

#[test]
fn free_reports_true_once_then_false() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    device.format(&Luks1::default(), &GenericParams::default())?;
    assert_eq!(device.dump(), 0);

    assert!(device.free());
    assert_eq!(device.dump(), -22);
    assert_eq!(device.state(), DeviceState::Freed);
    assert!(!device.free());
    assert!(!device.free());
    assert_eq!(disk.engine.freed(), 1);
    Ok(())
}

#[test]
fn zero_value_handle_frees_once() {
    let mut device: Device<FileEngine> = Device::default();
    assert_eq!(device.state(), DeviceState::Uninitialized);
    assert_eq!(device.type_name(), "");
    assert_eq!(device.dump(), -22);

    assert!(device.free());
    assert!(!device.free());
    assert_eq!(device.engine().freed(), 0);
}

#[test]
fn operations_after_free_fail_cleanly() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    device.format(&Luks1::default(), &GenericParams::default())?;
    device.free();

    let err = device
        .format(&Luks1::default(), &GenericParams::default())
        .unwrap_err();
    assert_eq!(err.code(), -22);
    assert_eq!(device.deactivate("vault").unwrap_err().code(), -22);
    assert_eq!(device.status("vault").unwrap_err().code(), -22);
    assert_eq!(device.type_name(), "");
    Ok(())
}

#[test]
fn dropping_a_handle_releases_its_context() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    {
        let _device = disk.open()?;
    }
    assert_eq!(disk.engine.freed(), 1);

    {
        let mut device = disk.open()?;
        assert!(device.free());
    }
    assert_eq!(disk.engine.freed(), 2);
    Ok(())
}

#[test]
fn deactivate_fails_when_mapping_is_not_active() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;

    let err = device.deactivate("vault").unwrap_err();
    assert!(matches!(err, CryptError::NotActive { .. }), "{err:?}");
    assert_eq!(err.code(), -19);
    Ok(())
}

#[test]
fn typed_operations_fail_on_bound_handle() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    let key = vec![0x5A; 32];

    let results = [
        device
            .activate_by_passphrase("vault", Some(0), "testPassphrase", ActivationFlags::READONLY)
            .map(drop),
        device.activate_by_volume_key("vault", &key, key.len(), ActivationFlags::READONLY),
        device
            .keyslot_add_by_volume_key(Some(0), &[], "testPassphrase")
            .map(drop),
        device
            .keyslot_add_by_passphrase(Some(0), "testPassphrase", "secondTestPassphrase")
            .map(drop),
        device
            .keyslot_change_by_passphrase(Some(0), Some(0), "testPassphrase", "second")
            .map(drop),
        device.keyslot_destroy(0),
    ];

    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, CryptError::InvalidState { .. }), "{err:?}");
        assert_eq!(err.code(), -22);
    }
    assert_eq!(disk.engine.calls(), 0);
    Ok(())
}

#[test]
fn passphrase_lifecycle_moves_through_active_state() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    device.format(&Luks1::default(), &GenericParams::default())?;

    let slot = device.keyslot_add_by_volume_key(None, &[], "correct horse")?;
    assert_eq!(slot, 0);

    let err = device
        .activate_by_passphrase("vault", None, "wrong", ActivationFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), -1);
    assert_eq!(device.state(), DeviceState::Typed);

    let opened =
        device.activate_by_passphrase("vault", None, "correct horse", ActivationFlags::READONLY)?;
    assert_eq!(opened, 0);
    assert_eq!(device.state(), DeviceState::Active);
    assert_eq!(device.status("vault")?, MappingState::Active);
    assert_eq!(disk.engine.last_flags(), Some(ActivationFlags::READONLY));

    let err = device
        .activate_by_passphrase("vault", None, "correct horse", ActivationFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), -17);

    device.deactivate("vault")?;
    assert_eq!(device.state(), DeviceState::Typed);
    assert_eq!(device.status("vault")?, MappingState::Inactive);
    Ok(())
}

#[test]
fn keyslot_management_round() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    device.format(&Luks1::default(), &GenericParams::default())?;
    device.keyslot_add_by_volume_key(Some(2), &[], "first")?;

    let added = device.keyslot_add_by_passphrase(None, "first", "second")?;
    assert_eq!(added, 0);

    let err = device
        .keyslot_add_by_passphrase(None, "nope", "third")
        .unwrap_err();
    assert_eq!(err.code(), -1);

    let changed = device.keyslot_change_by_passphrase(Some(2), Some(5), "first", "renewed")?;
    assert_eq!(changed, 5);

    device.keyslot_destroy(0)?;
    assert_eq!(device.keyslot_destroy(0).unwrap_err().code(), -2);

    let slot = device.activate_by_passphrase("vault", None, "renewed", ActivationFlags::empty())?;
    assert_eq!(slot, 5);
    device.deactivate("vault")?;
    Ok(())
}

#[test]
fn volume_key_activation_checks_key_length() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    let key = vec![0x11; 32];
    let params = GenericParams::new("aes", "xts-plain64", 32).with_volume_key(key.clone());
    device.format(&Luks1::default(), &params)?;

    let err = device
        .activate_by_volume_key("vault", &key, 64, ActivationFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), -22);

    device.activate_by_volume_key("vault", &key, key.len(), ActivationFlags::empty())?;
    assert_eq!(device.state(), DeviceState::Active);
    Ok(())
}

#[test]
fn format_rejects_mismatched_key_material() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;
    let params = GenericParams::default().with_volume_key(vec![0u8; 16]);

    let err = device.format(&Luks1::default(), &params).unwrap_err();
    assert_eq!(err.code(), -22);
    assert_eq!(device.type_name(), "");
    Ok(())
}

#[test]
fn engine_codes_pass_through_unchanged() -> CryptResult<()> {
    let disk = TestDisk::new()?;
    let mut device = disk.open()?;

    let err = device
        .format(&Luks1::default(), &GenericParams::new("rot13", "ecb", 64))
        .unwrap_err();
    assert!(matches!(err, CryptError::Engine { code: -95, .. }), "{err:?}");
    Ok(())
}

#[test]
fn independent_handles_work_in_parallel() {
    let handles: Vec<_> = (0..4)
        .map(|idx| {
            std::thread::spawn(move || -> CryptResult<String> {
                let disk = TestDisk::new()?;
                let mut device = disk.open()?;
                if idx % 2 == 0 {
                    device.format(&Luks1::default(), &GenericParams::default())?;
                } else {
                    device.format(&Luks2::default(), &GenericParams::default())?;
                }
                Ok(device.type_name())
            })
        })
        .collect();

    let names: Vec<String> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();
    assert_eq!(names, ["LUKS1", "LUKS2", "LUKS1", "LUKS2"]);
}

struct TestDisk {
    _dir: TempDir,
    path: PathBuf,
    engine: FileEngine,
}

impl TestDisk {
    fn new() -> CryptResult<Self> {
        let dir = tempdir()?;
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 4096])?;
        Ok(Self {
            _dir: dir,
            path,
            engine: FileEngine::default(),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> CryptResult<Device<FileEngine>> {
        Device::init(self.engine.clone(), &self.path)
    }

    fn digest(&self) -> CryptResult<String> {
        Ok(hex::encode(Sha256::digest(fs::read(&self.path)?)))
    }
}

/// Engine that stores a plain-text header at the start of a regular file.
#[derive(Debug, Clone, Default)]
struct FileEngine {
    mappings: Arc<Mutex<BTreeSet<String>>>,
    freed: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    last_flags: Arc<Mutex<Option<ActivationFlags>>>,
}

#[derive(Debug)]
struct FileContext {
    path: PathBuf,
    header: Option<Header>,
}

#[derive(Debug, Clone, PartialEq)]
struct Header {
    format: String,
    hash: String,
    cipher: String,
    volume_key: Vec<u8>,
    keyslots: BTreeMap<u32, Vec<u8>>,
}

impl FileEngine {
    fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_flags(&self) -> Option<ActivationFlags> {
        *self.last_flags.lock().unwrap()
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn persist(context: &FileContext) -> Status {
        let Some(header) = &context.header else {
            return -22;
        };
        let mut text = format!(
            "{MAGIC}format={}\nhash={}\ncipher={}\nkey={}\n",
            header.format,
            header.hash,
            header.cipher,
            hex::encode(&header.volume_key)
        );
        for (slot, passphrase) in &header.keyslots {
            text.push_str(&format!("slot={slot}:{}\n", hex::encode(passphrase)));
        }
        match fs::write(&context.path, text) {
            Ok(()) => 0,
            Err(_) => -5,
        }
    }

    fn read_header(path: &Path) -> Option<Header> {
        let contents = fs::read_to_string(path).ok()?;
        let body = contents.strip_prefix(MAGIC)?;
        let mut header = Header {
            format: String::new(),
            hash: String::new(),
            cipher: String::new(),
            volume_key: Vec::new(),
            keyslots: BTreeMap::new(),
        };
        for line in body.lines() {
            let (key, value) = line.split_once('=')?;
            match key {
                "format" => header.format = value.to_string(),
                "hash" => header.hash = value.to_string(),
                "cipher" => header.cipher = value.to_string(),
                "key" => header.volume_key = hex::decode(value).ok()?,
                "slot" => {
                    let (slot, passphrase) = value.split_once(':')?;
                    header
                        .keyslots
                        .insert(slot.parse().ok()?, hex::decode(passphrase).ok()?);
                }
                _ => return None,
            }
        }
        Some(header)
    }

    fn pick_slot(header: &Header, requested: Option<u32>) -> Result<u32, Status> {
        match requested {
            Some(slot) if slot >= MAX_KEYSLOTS => Err(-22),
            Some(slot) if header.keyslots.contains_key(&slot) => Err(-17),
            Some(slot) => Ok(slot),
            None => (0..MAX_KEYSLOTS)
                .find(|slot| !header.keyslots.contains_key(slot))
                .ok_or(-28),
        }
    }

    fn matching_slot(header: &Header, passphrase: &[u8]) -> Option<u32> {
        header
            .keyslots
            .iter()
            .find(|(_, stored)| stored.as_slice() == passphrase)
            .map(|(slot, _)| *slot)
    }
}

impl VolumeEngine for FileEngine {
    type Context = FileContext;

    fn init(&self, device: &Path) -> Result<FileContext, Status> {
        if !device.is_file() {
            return Err(-15);
        }
        Ok(FileContext {
            path: device.to_path_buf(),
            header: None,
        })
    }

    fn format(
        &self,
        context: &mut FileContext,
        format: &str,
        metadata: &FormatMetadata,
        params: &GenericParams,
    ) -> Status {
        self.record();
        if !SUPPORTED_CIPHERS.contains(&params.cipher.as_str()) {
            return -95;
        }
        let volume_key = match &params.volume_key {
            Some(key) if key.len() != params.volume_key_size => return -22,
            Some(key) => key.to_vec(),
            None => vec![0xA5; params.volume_key_size],
        };
        context.header = Some(Header {
            format: format.to_string(),
            hash: metadata.hash().to_string(),
            cipher: params.cipher_spec(),
            volume_key,
            keyslots: BTreeMap::new(),
        });
        Self::persist(context)
    }

    fn load(&self, context: &mut FileContext, format: &str, _metadata: &FormatMetadata) -> Status {
        self.record();
        match Self::read_header(&context.path) {
            Some(header) if header.format == format => {
                context.header = Some(header);
                0
            }
            _ => -22,
        }
    }

    fn activate_by_passphrase(
        &self,
        context: &mut FileContext,
        name: &str,
        keyslot: Option<u32>,
        passphrase: &[u8],
        flags: ActivationFlags,
    ) -> Status {
        self.record();
        let Some(header) = &context.header else {
            return -22;
        };
        let slot = match (keyslot, Self::matching_slot(header, passphrase)) {
            (Some(wanted), Some(found)) if wanted == found => found,
            (None, Some(found)) => found,
            _ => return -1,
        };
        let mut mappings = self.mappings.lock().unwrap();
        if !mappings.insert(name.to_string()) {
            return -17;
        }
        *self.last_flags.lock().unwrap() = Some(flags);
        slot as Status
    }

    fn activate_by_volume_key(
        &self,
        context: &mut FileContext,
        name: &str,
        volume_key: &[u8],
        volume_key_size: usize,
        flags: ActivationFlags,
    ) -> Status {
        self.record();
        let Some(header) = &context.header else {
            return -22;
        };
        if volume_key.len() != volume_key_size {
            return -22;
        }
        if header.volume_key != volume_key {
            return -1;
        }
        if !self.mappings.lock().unwrap().insert(name.to_string()) {
            return -17;
        }
        *self.last_flags.lock().unwrap() = Some(flags);
        0
    }

    fn deactivate(&self, _context: &mut FileContext, name: &str) -> Status {
        self.record();
        if self.mappings.lock().unwrap().remove(name) {
            0
        } else {
            -19
        }
    }

    fn keyslot_add_by_volume_key(
        &self,
        context: &mut FileContext,
        keyslot: Option<u32>,
        volume_key: &[u8],
        passphrase: &[u8],
    ) -> Status {
        self.record();
        let Some(header) = context.header.as_mut() else {
            return -22;
        };
        if !volume_key.is_empty() && volume_key != header.volume_key.as_slice() {
            return -1;
        }
        let slot = match Self::pick_slot(header, keyslot) {
            Ok(slot) => slot,
            Err(code) => return code,
        };
        header.keyslots.insert(slot, passphrase.to_vec());
        match Self::persist(context) {
            0 => slot as Status,
            code => code,
        }
    }

    fn keyslot_add_by_passphrase(
        &self,
        context: &mut FileContext,
        keyslot: Option<u32>,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Status {
        self.record();
        let Some(header) = context.header.as_mut() else {
            return -22;
        };
        if Self::matching_slot(header, passphrase).is_none() {
            return -1;
        }
        let slot = match Self::pick_slot(header, keyslot) {
            Ok(slot) => slot,
            Err(code) => return code,
        };
        header.keyslots.insert(slot, new_passphrase.to_vec());
        match Self::persist(context) {
            0 => slot as Status,
            code => code,
        }
    }

    fn keyslot_change_by_passphrase(
        &self,
        context: &mut FileContext,
        keyslot_old: Option<u32>,
        keyslot_new: Option<u32>,
        passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Status {
        self.record();
        let Some(header) = context.header.as_mut() else {
            return -22;
        };
        let old = match (keyslot_old, Self::matching_slot(header, passphrase)) {
            (Some(wanted), Some(found)) if wanted == found => found,
            (None, Some(found)) => found,
            _ => return -1,
        };
        header.keyslots.remove(&old);
        let slot = match keyslot_new {
            None => old,
            Some(slot) => match Self::pick_slot(header, Some(slot)) {
                Ok(slot) => slot,
                Err(code) => return code,
            },
        };
        header.keyslots.insert(slot, new_passphrase.to_vec());
        match Self::persist(context) {
            0 => slot as Status,
            code => code,
        }
    }

    fn keyslot_destroy(&self, context: &mut FileContext, keyslot: u32) -> Status {
        self.record();
        let Some(header) = context.header.as_mut() else {
            return -22;
        };
        if header.keyslots.remove(&keyslot).is_none() {
            return -2;
        }
        Self::persist(context)
    }

    fn status(&self, _context: &FileContext, name: &str) -> MappingState {
        if self.mappings.lock().unwrap().contains(name) {
            MappingState::Active
        } else {
            MappingState::Inactive
        }
    }

    fn dump(&self, context: &FileContext) -> Status {
        match &context.header {
            Some(_) => 0,
            None => -22,
        }
    }

    fn get_type(&self, context: &FileContext) -> Option<String> {
        context.header.as_ref().map(|header| header.format.clone())
    }

    fn free(&self, _context: FileContext) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}
