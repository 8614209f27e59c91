//! Short-lived files for key material `cryptsetup` only accepts by path.

use std::env;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};

const SHM_DIR: &str = "/dev/shm";

/// Owner-only temporary file holding secret bytes.
///
/// The contents are overwritten with zeros before the file is removed.
pub(crate) struct SecretFile {
    file: NamedTempFile,
    len: usize,
}

impl SecretFile {
    pub(crate) fn new(contents: &[u8]) -> io::Result<Self> {
        let mut file = Builder::new()
            .prefix(".cryptvol-")
            .tempfile_in(secret_dir())?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        Ok(Self {
            file,
            len: contents.len(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        let _ = scrub(self.file.as_file_mut(), self.len);
    }
}

fn scrub(file: &mut File, len: usize) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&vec![0u8; len])?;
    file.sync_all()
}

/// Prefer memory-backed storage so secrets do not reach a disk.
fn secret_dir() -> PathBuf {
    let shm = Path::new(SHM_DIR);
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        env::temp_dir()
    }
}
