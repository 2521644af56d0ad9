//! Single-backend front-end: a thin dispatcher fixing one backend plus
//! the recursive convenience operations the bare backend vtable doesn't
//! offer.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use vfskit_error::{ErrorKind, Result};
use vfskit_path as pathutil;

use crate::backend::{Backend, DirEntry, File, Mode, OpenMode, PATH_MAX};

const COPY_CHUNK: usize = 512;

/// Holds one backend and the current-working-directory string the
/// front-end maintains on the caller's behalf. Every relative path is
/// resolved against this cwd before being handed to the backend; the
/// backend's own notion of cwd (if it has one) is kept in sync via
/// `chdir` so that a backend which interprets paths itself still agrees.
pub struct SingleFs {
    backend: Box<dyn Backend>,
    cwd: String,
}

impl SingleFs {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        SingleFs { backend, cwd: String::from("/") }
    }

    fn resolve(&self, path: &str) -> Result<String> {
        pathutil::resolve(&self.cwd, path, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn File>> {
        let resolved = self.resolve(path)?;
        self.backend.open(&resolved, mode)
    }

    pub fn close(&self, file: Box<dyn File>) -> Result<()> {
        file.close()
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        self.backend.mkdir(&resolved)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        self.backend.remove(&resolved)
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old = self.resolve(old_path)?;
        let new = self.resolve(new_path)?;
        self.backend.rename(&old, &new)
    }

    pub fn stat(&self, path: &str) -> Result<crate::backend::Stat> {
        let resolved = self.resolve(path)?;
        self.backend.stat(&resolved)
    }

    pub fn utime(&self, path: &str, mtime: u64) -> Result<()> {
        let resolved = self.resolve(path)?;
        self.backend.utime(&resolved, mtime)
    }

    /// Changes the current directory, refusing anything that doesn't
    /// stat as a directory. The cwd string is only replaced once the
    /// stat succeeds, so a failed chdir leaves the old cwd intact.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let stat = self.backend.stat(&resolved)?;
        if stat.mode != Mode::Directory {
            return Err(ErrorKind::NotDirectory);
        }
        // Best-effort: a backend with no notion of its own cwd reports
        // NotSupported here, which is fine, since the union layer is
        // authoritative for path resolution anyway.
        let _ = self.backend.chdir(&resolved);
        self.cwd = resolved;
        Ok(())
    }

    pub fn getcwd(&self, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.cwd.as_bytes();
        if bytes.len() > buf.len() {
            return Err(ErrorKind::Range);
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut dir = self.backend.opendir(path)?;
        let mut out = Vec::new();
        loop {
            match dir.next() {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => break,
                Err(e) => {
                    let _ = dir.close();
                    return Err(e);
                }
            }
        }
        dir.close()?;
        Ok(out)
    }

    /// Streams `src` into `dst` in fixed-size chunks, creating/truncating
    /// `dst`. A short write on the destination is reported as
    /// `no-space`, matching a size-limited backend running out of room
    /// mid-copy.
    pub fn copyfile(&self, src: &str, dst: &str) -> Result<()> {
        let src_resolved = self.resolve(src)?;
        let dst_resolved = self.resolve(dst)?;
        let src_file = self.backend.open(&src_resolved, OpenMode::Read)?;
        let dst_file = match self.backend.open(&dst_resolved, OpenMode::Write) {
            Ok(f) => f,
            Err(e) => {
                let _ = src_file.close();
                return Err(e);
            }
        };
        Self::stream_copy(src_file, dst_file)
    }

    fn stream_copy(src: Box<dyn File>, dst: Box<dyn File>) -> Result<()> {
        let mut buf = [0u8; COPY_CHUNK];
        let mut src = scopeguard::guard(src, |f| {
            let _ = f.close();
        });
        let mut dst = scopeguard::guard(dst, |f| {
            let _ = f.close();
        });
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let written = dst.write(&buf[..n])?;
            if written < n {
                return Err(ErrorKind::NoSpace);
            }
        }
        dst.flush()
    }

    /// Recursively copies a directory tree. `dst` must not already
    /// exist: it is created as a fresh directory before any children are
    /// copied, and every subdirectory is created before its contents are
    /// descended into.
    pub fn copytree(&self, src: &str, dst: &str) -> Result<()> {
        self.mkdir(dst)?;
        let entries = self.list(&self.resolve(src)?)?;
        for entry in entries {
            let child_src = pathutil::join(src, &entry.name, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)?;
            let child_dst = pathutil::join(dst, &entry.name, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)?;
            let stat = self.stat(&child_src)?;
            match stat.mode {
                Mode::Directory => self.copytree(&child_src, &child_dst)?,
                Mode::Regular => self.copyfile(&child_src, &child_dst)?,
            }
        }
        Ok(())
    }

    /// Recursively removes a directory tree, deleting files before the
    /// directories that contained them.
    pub fn rmtree(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let stat = self.backend.stat(&resolved)?;
        if stat.mode != Mode::Directory {
            return self.backend.remove(&resolved);
        }
        let entries = self.list(&resolved)?;
        for entry in entries {
            let child = pathutil::join(path, &entry.name, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)?;
            self.rmtree(&child)?;
        }
        self.backend.remove(&resolved)
    }

    /// Pre-order traversal of `path`. The callback receives the full
    /// path of each visited entry and whether it is a directory;
    /// returning `false` stops the walk early without reporting an
    /// error.
    pub fn walktree(&self, path: &str, callback: &mut dyn FnMut(&str, bool) -> bool) -> Result<()> {
        self.walktree_inner(path, callback)
    }

    fn walktree_inner(&self, path: &str, callback: &mut dyn FnMut(&str, bool) -> bool) -> Result<()> {
        let resolved = self.resolve(path)?;
        let entries = self.list(&resolved)?;
        for entry in entries {
            let child = pathutil::join(path, &entry.name, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)?;
            let stat = self.stat(&child)?;
            let is_dir = stat.mode == Mode::Directory;
            if !callback(&child, is_dir) {
                return Ok(());
            }
            if is_dir {
                self.walktree_inner(&child, callback)?;
            }
        }
        Ok(())
    }

    /// Creates every missing ancestor of `path`, then `path` itself. If
    /// `path` already exists, succeeds only when `exist_ok` is set.
    pub fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        let resolved = self.resolve(path)?;
        let mut segments: Vec<String> = Vec::new();
        let mut rest: &str = &resolved;
        while let Some((seg, next)) = pathutil::top(rest) {
            segments.push(seg.to_string());
            rest = next;
        }

        let drive_prefix = match pathutil::drive(&resolved) {
            Some(d) => {
                let mut p = String::new();
                p.push(d);
                p.push(':');
                p
            }
            None => String::new(),
        };

        let mut built = vec![drive_prefix];
        built[0].push('/');
        let mut current = built[0].clone();

        for (i, seg) in segments.iter().enumerate() {
            if current.ends_with('/') {
                current.push_str(seg);
            } else {
                current.push('/');
                current.push_str(seg);
            }
            let is_last = i + 1 == segments.len();
            match self.backend.mkdir(&current) {
                Ok(()) => {}
                Err(ErrorKind::Exist) => {
                    if is_last && !exist_ok {
                        return Err(ErrorKind::Exist);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Dir, OpenFlags, SeekFrom, Stat};
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use spin::Mutex;

    struct MemFile {
        data: Arc<Mutex<Vec<u8>>>,
        pos: usize,
    }

    impl File for MemFile {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let data = self.data.lock();
            let remaining = data.len().saturating_sub(self.pos);
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let mut data = self.data.lock();
            if self.pos + buf.len() > data.len() {
                data.resize(self.pos + buf.len(), 0);
            }
            data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
            self.pos += buf.len();
            Ok(buf.len())
        }
        fn seek(&mut self, offset: i64, whence: SeekFrom) -> Result<u64> {
            let len = self.data.lock().len();
            let base = match whence {
                SeekFrom::Start => 0,
                SeekFrom::Current => self.pos as i64,
                SeekFrom::End => len as i64,
            };
            self.pos = (base + offset).max(0) as usize;
            Ok(self.pos as u64)
        }
        fn tell(&self) -> Result<u64> {
            Ok(self.pos as u64)
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct MemDir {
        names: Vec<String>,
        idx: usize,
    }

    impl Dir for MemDir {
        fn next(&mut self) -> Result<Option<DirEntry>> {
            if self.idx >= self.names.len() {
                return Ok(None);
            }
            let name = self.names[self.idx].parse().unwrap();
            self.idx += 1;
            Ok(Some(DirEntry { name }))
        }
        fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    /// A deliberately tiny in-memory backend, flat (no subdirectories)
    /// except for a fixed root, just rich enough to exercise the
    /// single-backend front-end's convenience operations in isolation
    /// from the real RAM filesystem.
    struct ToyBackend {
        files: Mutex<BTreeMap<String, Arc<Mutex<Vec<u8>>>>>,
        dirs: Mutex<BTreeMap<String, Vec<String>>>,
    }

    impl ToyBackend {
        fn new() -> Self {
            let mut dirs = BTreeMap::new();
            dirs.insert(String::from("/"), Vec::new());
            ToyBackend { files: Mutex::new(BTreeMap::new()), dirs: Mutex::new(dirs) }
        }
    }

    impl Backend for ToyBackend {
        fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn File>> {
            let mut files = self.files.lock();
            let flags = mode.flags();
            if !files.contains_key(path) {
                if mode.creates() {
                    files.insert(path.to_string(), Arc::new(Mutex::new(Vec::new())));
                } else {
                    return Err(ErrorKind::NoEntry);
                }
            }
            let data = files.get(path).unwrap().clone();
            if flags.contains(OpenFlags::TRUNCATE) {
                data.lock().clear();
            }
            Ok(Box::new(MemFile { data, pos: 0 }))
        }

        fn mkdir(&self, path: &str) -> Result<()> {
            let mut dirs = self.dirs.lock();
            if dirs.contains_key(path) {
                return Err(ErrorKind::Exist);
            }
            dirs.insert(path.to_string(), Vec::new());
            dirs.get_mut("/").unwrap().push(path.to_string());
            Ok(())
        }

        fn opendir(&self, path: &str) -> Result<Box<dyn Dir>> {
            let dirs = self.dirs.lock();
            let mut names: Vec<String> = Vec::new();
            if path == "/" {
                for f in self.files.lock().keys() {
                    if let Some(n) = f.strip_prefix('/') {
                        if !n.contains('/') {
                            names.push(n.to_string());
                        }
                    }
                }
                if let Some(children) = dirs.get("/") {
                    for d in children {
                        if let Some(n) = d.strip_prefix('/') {
                            names.push(n.to_string());
                        }
                    }
                }
            }
            Ok(Box::new(MemDir { names, idx: 0 }))
        }

        fn chdir(&self, _path: &str) -> Result<()> {
            Err(ErrorKind::NotSupported)
        }

        fn getcwd(&self, _buf: &mut [u8]) -> Result<usize> {
            Err(ErrorKind::NotSupported)
        }

        fn remove(&self, path: &str) -> Result<()> {
            self.files.lock().remove(path);
            Ok(())
        }

        fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
            let mut files = self.files.lock();
            let data = files.remove(old_path).ok_or(ErrorKind::NoEntry)?;
            files.insert(new_path.to_string(), data);
            Ok(())
        }

        fn stat(&self, path: &str) -> Result<Stat> {
            if let Some(data) = self.files.lock().get(path) {
                return Ok(Stat { size: data.lock().len() as u64, mtime: 0, mode: Mode::Regular });
            }
            if self.dirs.lock().contains_key(path) {
                return Ok(Stat { size: 0, mtime: 0, mode: Mode::Directory });
            }
            Err(ErrorKind::NoEntry)
        }

        fn utime(&self, _path: &str, _mtime: u64) -> Result<()> {
            Err(ErrorKind::NotSupported)
        }
    }

    #[test]
    fn copyfile_round_trip() {
        let fs = SingleFs::new(Box::new(ToyBackend::new()));
        let mut f = fs.open("/a.txt", OpenMode::Write).unwrap();
        f.write(b"hello world").unwrap();
        fs.close(f).unwrap();

        fs.copyfile("/a.txt", "/b.txt").unwrap();

        let mut g = fs.open("/b.txt", OpenMode::Read).unwrap();
        let mut buf = [0u8; 32];
        let n = g.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn makedirs_reports_exist_unless_ok() {
        let fs = SingleFs::new(Box::new(ToyBackend::new()));
        fs.mkdir("/sub").unwrap();
        assert_eq!(fs.makedirs("/sub", false), Err(ErrorKind::Exist));
        assert_eq!(fs.makedirs("/sub", true), Ok(()));
    }
}
