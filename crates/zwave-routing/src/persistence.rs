//! Persistent storage boundary
//!
//! Routing state survives restarts through a small key/value interface. The
//! values are opaque byte strings; callers bincode-encode their own records.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::trace;
use zwave_protocol::NodeId;

use crate::error::Result;

/// Record identifiers in non-volatile memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NvmKey {
    RouteCache { dest: NodeId },
    MostUsed,
    PreferredRepeaters,
}

impl NvmKey {
    fn file_name(&self) -> String {
        match self {
            NvmKey::RouteCache { dest } => format!("route_cache_{:03}.bin", dest.as_u16()),
            NvmKey::MostUsed => "most_used.bin".to_string(),
            NvmKey::PreferredRepeaters => "preferred_repeaters.bin".to_string(),
        }
    }
}

/// Key/value store backing the routing state
pub trait NvmStore: Send {
    fn read(&self, key: NvmKey) -> Result<Option<Vec<u8>>>;

    fn write(&mut self, key: NvmKey, value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error
    fn remove(&mut self, key: NvmKey) -> Result<()>;
}

/// Volatile store, used in tests and when no storage directory is configured
#[derive(Debug, Default)]
pub struct MemoryNvm {
    records: HashMap<NvmKey, Vec<u8>>,
}

impl MemoryNvm {
    pub fn new() -> Self {
        MemoryNvm::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl NvmStore for MemoryNvm {
    fn read(&self, key: NvmKey) -> Result<Option<Vec<u8>>> {
        Ok(self.records.get(&key).cloned())
    }

    fn write(&mut self, key: NvmKey, value: &[u8]) -> Result<()> {
        self.records.insert(key, value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: NvmKey) -> Result<()> {
        self.records.remove(&key);
        Ok(())
    }
}

/// One file per record inside a directory
#[derive(Debug, Clone)]
pub struct FileNvm {
    dir: PathBuf,
}

impl FileNvm {
    /// Open (and create if needed) the storage directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileNvm { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: NvmKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl NvmStore for FileNvm {
    fn read(&self, key: NvmKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, key: NvmKey, value: &[u8]) -> Result<()> {
        let path = self.path(key);
        // Records are replaced atomically
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        trace!("Wrote {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    fn remove(&mut self, key: NvmKey) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
