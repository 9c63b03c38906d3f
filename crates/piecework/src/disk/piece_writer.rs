use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

/// Raw storage for torrent files. Called from blocking threads only.
pub trait PieceWriter: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Missing files and reads
    /// past the end return fewer bytes, not errors.
    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize>;

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    fn flush(&self, path: &Path) -> anyhow::Result<()>;

    fn close(&self, path: &Path) -> anyhow::Result<()>;
}

/// Files under a root directory. At most `max_open_files` handles are kept
/// open; the least recently used one is closed to make room.
pub struct FilesystemPieceWriter {
    root: PathBuf,
    open_files: Mutex<LruCache<PathBuf, Arc<Mutex<File>>>>,
}

impl FilesystemPieceWriter {
    pub fn new(root: impl Into<PathBuf>, max_open_files: usize) -> Self {
        let cap = NonZeroUsize::new(max_open_files).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.into(),
            open_files: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.lock().len()
    }

    fn get_or_open(&self, path: &Path, create: bool) -> anyhow::Result<Option<Arc<Mutex<File>>>> {
        if let Some(f) = self.open_files.lock().get(path) {
            return Ok(Some(f.clone()));
        }
        let full_path = self.root.join(path);
        if create {
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("error creating {parent:?}"))?;
            }
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&full_path)
        {
            Ok(f) => f,
            Err(e) if !create && e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("error opening {full_path:?}")),
        };
        trace!(?full_path, "opened");
        let file = Arc::new(Mutex::new(file));
        self.open_files.lock().push(path.to_owned(), file.clone());
        Ok(Some(file))
    }
}

impl PieceWriter for FilesystemPieceWriter {
    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        let Some(file) = self.get_or_open(path, false)? else {
            return Ok(0);
        };
        let mut g = file.lock();
        g.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match g.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).with_context(|| format!("error reading {path:?}")),
            }
        }
        Ok(read)
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let file = self
            .get_or_open(path, true)?
            .context("bug: file not created")?;
        let mut g = file.lock();
        g.seek(SeekFrom::Start(offset))?;
        g.write_all(data)
            .with_context(|| format!("error writing {} bytes to {path:?}", data.len()))
    }

    fn flush(&self, path: &Path) -> anyhow::Result<()> {
        let file = self.open_files.lock().peek(path).cloned();
        if let Some(file) = file {
            file.lock()
                .sync_data()
                .with_context(|| format!("error syncing {path:?}"))?;
        }
        Ok(())
    }

    fn close(&self, path: &Path) -> anyhow::Result<()> {
        self.open_files.lock().pop(path);
        Ok(())
    }
}

/// Keeps file contents in memory. Writes and reads can be made to fail.
#[derive(Default)]
pub struct InMemoryPieceWriter {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryPieceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed)
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }
}

impl PieceWriter for InMemoryPieceWriter {
    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        if self.fail_reads.load(Ordering::Relaxed) {
            anyhow::bail!("simulated read failure on {path:?}");
        }
        let g = self.files.lock();
        let Some(content) = g.get(path) else {
            return Ok(0);
        };
        let start = (offset as usize).min(content.len());
        let n = (content.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&content[start..start + n]);
        Ok(n)
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            anyhow::bail!("simulated write failure on {path:?}");
        }
        let mut g = self.files.lock();
        let content = g.entry(path.to_owned()).or_default();
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_read_write_and_lru_close() {
        let dir = tempfile::tempdir().unwrap();
        let w = FilesystemPieceWriter::new(dir.path(), 2);

        let mut buf = [0u8; 4];
        assert_eq!(w.read(Path::new("missing"), 0, &mut buf).unwrap(), 0);

        w.write(Path::new("a/one"), 2, b"abcd").unwrap();
        w.write(Path::new("two"), 0, b"xy").unwrap();
        w.write(Path::new("three"), 0, b"z").unwrap();
        assert_eq!(w.open_file_count(), 2);

        assert_eq!(w.read(Path::new("a/one"), 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"\0\0ab");
        assert_eq!(w.read(Path::new("a/one"), 4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"cd");
        w.flush(Path::new("a/one")).unwrap();
        w.close(Path::new("a/one")).unwrap();
        assert_eq!(std::fs::read(dir.path().join("a/one")).unwrap(), b"\0\0abcd");
    }

    #[test]
    fn test_in_memory_failures() {
        let w = InMemoryPieceWriter::new();
        w.write(Path::new("f"), 3, b"hi").unwrap();
        assert_eq!(w.contents(Path::new("f")).unwrap(), b"\0\0\0hi");
        w.set_fail_writes(true);
        assert!(w.write(Path::new("f"), 0, b"x").is_err());
        w.set_fail_reads(true);
        assert!(w.read(Path::new("f"), 0, &mut [0; 2]).is_err());
    }
}
