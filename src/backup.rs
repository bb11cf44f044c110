//! Durable fallback storage for the last known feature set.
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rand::{thread_rng, Rng};

use crate::Result;

/// A durable, file-like store. Values are always replaced whole.
pub trait BackupStore: Send + Sync {
    /// Whether something has been written under `path`.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Read everything stored under `path`.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace the value stored under `path`.
    fn write(&self, path: &str, contents: &[u8]) -> Result<()>;
}

/// Stores backups as files in a directory on the local disk.
///
/// Writes go to a temporary file that is then renamed over the target, so concurrent readers in
/// other processes see either the old or the new file, never a torn one.
#[derive(Debug, Clone)]
pub struct FileBackup {
    dir: PathBuf,
}

impl FileBackup {
    /// Keep backups in `dir`. The directory is created on first write if needed.
    pub fn new(dir: impl Into<PathBuf>) -> FileBackup {
        FileBackup { dir: dir.into() }
    }

    /// Keep backups in the OS temporary directory.
    pub fn in_temp_dir() -> FileBackup {
        FileBackup::new(std::env::temp_dir())
    }

    /// Directory backups are kept in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Default for FileBackup {
    fn default() -> FileBackup {
        FileBackup::in_temp_dir()
    }
}

impl BackupStore for FileBackup {
    fn exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.dir.join(path)) {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.dir.join(path))?)
    }

    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let tmp = self.dir.join(format!(
            ".{path}.{}.{:08x}.tmp",
            std::process::id(),
            thread_rng().gen::<u32>()
        ));
        fs::write(&tmp, contents)?;
        if let Err(err) = fs::rename(&tmp, self.dir.join(path)) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Keeps backups in memory. Useful for tests and for processes that must never touch the disk.
#[derive(Debug, Default)]
pub struct MemoryBackup {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackup {
    /// Create an empty in-memory backup.
    pub fn new() -> MemoryBackup {
        MemoryBackup::default()
    }
}

impl BackupStore for MemoryBackup {
    fn exists(&self, path: &str) -> Result<bool> {
        let files = self
            .files
            .lock()
            .expect("thread holding backup lock should not panic");
        Ok(files.contains_key(path))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let files = self
            .files
            .lock()
            .expect("thread holding backup lock should not panic");
        files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, format!("no backup at {path:?}")).into()
        })
    }

    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .expect("thread holding backup lock should not panic");
        files.insert(path.to_owned(), contents.to_vec());
        Ok(())
    }
}

impl<T: BackupStore + ?Sized> BackupStore for std::sync::Arc<T> {
    fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path)
    }

    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        (**self).write(path, contents)
    }
}
