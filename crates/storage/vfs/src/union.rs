//! Union-mount front-end: composes several backends under one virtual
//! path tree, resolving every path to its owning mount before forwarding
//! the operation.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use vfskit_error::{ErrorKind, Result};
use vfskit_path as pathutil;

use crate::backend::{Backend, Dir, DirEntry, File, Mode, OpenMode, Stat, PATH_MAX};

const COPY_CHUNK: usize = 512;

struct MountEntry {
    virtual_path: String,
    real_path: String,
    backend: Box<dyn Backend>,
    /// Index, in the owning `UnionFs`'s mount vector, of the mount whose
    /// virtual-path is the longest proper-prefix directory of this one.
    /// `None` only for the root mount.
    parent_index: Option<usize>,
}

/// True if `mount_vpath` is `v` itself or a real path-segment ancestor of
/// it (never just a string prefix: `/mnt` must not match `/mntfoo`).
fn is_prefix(mount_vpath: &str, v: &str) -> bool {
    if mount_vpath == "/" {
        return true;
    }
    v == mount_vpath || (v.starts_with(mount_vpath) && v.as_bytes().get(mount_vpath.len()) == Some(&b'/'))
}

/// Composes several backends under a single virtual path tree. Mounts are
/// kept in a flat vector; a mount's `parent_index` is computed once, at
/// mount time, rather than re-derived on every `stat` of a mount point.
pub struct UnionFs {
    mounts: Vec<MountEntry>,
    cwd: String,
}

impl UnionFs {
    pub fn new() -> Self {
        UnionFs { mounts: Vec::new(), cwd: String::from("/") }
    }

    fn resolve(&self, path: &str) -> Result<String> {
        pathutil::resolve(&self.cwd, path, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)
    }

    /// Selects the mount with the longest virtual-path that is a proper
    /// prefix of (or equal to) `v`. Ties cannot occur: two mounts sharing
    /// the longest matching prefix would have to share a virtual-path,
    /// which mount-time uniqueness forbids.
    fn find_mount(&self, v: &str) -> Result<usize> {
        let mut best: Option<usize> = None;
        let mut best_len = 0usize;
        for (i, m) in self.mounts.iter().enumerate() {
            if is_prefix(&m.virtual_path, v) && (best.is_none() || m.virtual_path.len() > best_len) {
                best = Some(i);
                best_len = m.virtual_path.len();
            }
        }
        best.ok_or(ErrorKind::NoEntry)
    }

    /// Substring-replaces the virtual-path portion of `v` with the
    /// mount's real-path, handling the root/non-root corner cases: `rest`
    /// is either empty (querying the mount point itself) or always
    /// starts with `/`.
    fn translate(mount: &MountEntry, v: &str) -> String {
        let rest: String = if v == mount.virtual_path {
            String::new()
        } else if mount.virtual_path == "/" {
            String::from(v)
        } else {
            String::from(&v[mount.virtual_path.len()..])
        };
        if rest.is_empty() {
            mount.real_path.clone()
        } else if mount.real_path == "/" {
            rest
        } else {
            let mut s = mount.real_path.clone();
            s.push_str(&rest);
            s
        }
    }

    fn locate(&self, path: &str) -> Result<(usize, String, String)> {
        let vpath = self.resolve(path)?;
        let idx = self.find_mount(&vpath)?;
        let real = Self::translate(&self.mounts[idx], &vpath);
        Ok((idx, vpath, real))
    }

    /// `stat`, with the mount-point synthesis rule applied: stat of an
    /// exact mount-point path is answered by the parent mount (or
    /// synthetically, for the root mount which has none).
    fn stat_at(&self, idx: usize, vpath: &str, real: &str) -> Result<Stat> {
        if vpath == self.mounts[idx].virtual_path {
            return match self.mounts[idx].parent_index {
                None => Ok(Stat { size: 0, mtime: 0, mode: Mode::Directory }),
                Some(parent_idx) => {
                    let parent_real = Self::translate(&self.mounts[parent_idx], vpath);
                    self.mounts[parent_idx].backend.stat(&parent_real)
                }
            };
        }
        self.mounts[idx].backend.stat(real)
    }

    /// Binds `backend` at `virtual_path`, serving reads/writes under that
    /// subtree from `real_path` on the backend. The first mount must be
    /// `"/"`. Every later mount's virtual-path must resolve, against the
    /// mounts already present, to an existing directory.
    pub fn mount(&mut self, virtual_path: &str, real_path: &str, backend: Box<dyn Backend>) -> Result<()> {
        let vpath = pathutil::resolve_dot(virtual_path);
        let rpath = pathutil::resolve_dot(real_path);
        if !pathutil::is_absolute(&vpath) {
            return Err(ErrorKind::Invalid);
        }
        if self.mounts.iter().any(|m| m.virtual_path == vpath) {
            return Err(ErrorKind::Exist);
        }
        if self.mounts.is_empty() {
            if vpath != "/" {
                return Err(ErrorKind::Invalid);
            }
            self.mounts.push(MountEntry { virtual_path: vpath, real_path: rpath, backend, parent_index: None });
            return Ok(());
        }
        let parent_idx = self.find_mount(&vpath)?;
        let parent_real = Self::translate(&self.mounts[parent_idx], &vpath);
        let stat = self.mounts[parent_idx].backend.stat(&parent_real)?;
        if stat.mode != Mode::Directory {
            return Err(ErrorKind::NotDirectory);
        }
        self.mounts.push(MountEntry {
            virtual_path: vpath,
            real_path: rpath,
            backend,
            parent_index: Some(parent_idx),
        });
        Ok(())
    }

    /// Unbinds the mount at `virtual_path`. Refuses a mount with
    /// sub-mounts beneath it, and refuses the mount the cwd currently
    /// resolves into, both with *busy*.
    pub fn umount(&mut self, virtual_path: &str) -> Result<()> {
        let vpath = pathutil::resolve_dot(virtual_path);
        let idx = self.mounts.iter().position(|m| m.virtual_path == vpath).ok_or(ErrorKind::NoEntry)?;
        if self.mounts.iter().any(|m| m.parent_index == Some(idx)) {
            return Err(ErrorKind::Busy);
        }
        if let Ok(cwd_idx) = self.find_mount(&self.cwd) {
            if cwd_idx == idx {
                return Err(ErrorKind::Busy);
            }
        }
        self.mounts.remove(idx);
        for m in self.mounts.iter_mut() {
            if let Some(p) = m.parent_index {
                if p > idx {
                    m.parent_index = Some(p - 1);
                }
            }
        }
        Ok(())
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn File>> {
        let (idx, _vpath, real) = self.locate(path)?;
        self.mounts[idx].backend.open(&real, mode)
    }

    pub fn close(&self, file: Box<dyn File>) -> Result<()> {
        file.close()
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (idx, _vpath, real) = self.locate(path)?;
        self.mounts[idx].backend.mkdir(&real)
    }

    pub fn opendir(&self, path: &str) -> Result<Box<dyn Dir>> {
        let (idx, _vpath, real) = self.locate(path)?;
        self.mounts[idx].backend.opendir(&real)
    }

    /// Changes the current directory, refusing anything that doesn't
    /// stat as a directory. The cwd string is only replaced once the
    /// stat succeeds.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let (idx, vpath, real) = self.locate(path)?;
        let stat = self.stat_at(idx, &vpath, &real)?;
        if stat.mode != Mode::Directory {
            return Err(ErrorKind::NotDirectory);
        }
        self.cwd = vpath;
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

    /// Refuses paths that name an existing mount point with *busy*.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (idx, vpath, real) = self.locate(path)?;
        if vpath == self.mounts[idx].virtual_path {
            return Err(ErrorKind::Busy);
        }
        self.mounts[idx].backend.remove(&real)
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let (idx, vpath, real) = self.locate(path)?;
        self.stat_at(idx, &vpath, &real)
    }

    pub fn utime(&self, path: &str, mtime: u64) -> Result<()> {
        let (idx, _vpath, real) = self.locate(path)?;
        self.mounts[idx].backend.utime(&real, mtime)
    }

    /// Within one mount this is a single backend `rename`. Across mounts
    /// there is no such primitive, so this recursively copies the source
    /// to the destination and then removes the source.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let (old_idx, old_vpath, old_real) = self.locate(old_path)?;
        let (new_idx, _new_vpath, new_real) = self.locate(new_path)?;
        if old_vpath == self.mounts[old_idx].virtual_path {
            return Err(ErrorKind::Busy);
        }
        if old_idx == new_idx {
            return self.mounts[old_idx].backend.rename(&old_real, &new_real);
        }
        let stat = self.mounts[old_idx].backend.stat(&old_real)?;
        if stat.mode == Mode::Directory {
            self.copytree(old_path, new_path)?;
            self.rmtree(old_path)
        } else {
            self.copyfile(old_path, new_path)?;
            self.mounts[old_idx].backend.remove(&old_real)
        }
    }

    fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut dir = self.opendir(path)?;
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

    /// Streams `src` into `dst` in fixed-size chunks. The two paths may
    /// resolve to different mounts; each call to `open` re-derives the
    /// owning backend independently.
    pub fn copyfile(&self, src: &str, dst: &str) -> Result<()> {
        let src_file = self.open(src, OpenMode::Read)?;
        let dst_file = match self.open(dst, OpenMode::Write) {
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

    /// Recursively copies a directory tree, re-resolving the owning mount
    /// at every step so a copy can cross mount boundaries transparently.
    pub fn copytree(&self, src: &str, dst: &str) -> Result<()> {
        self.mkdir(dst)?;
        let entries = self.list(src)?;
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

    /// Recursively removes a directory tree, leaves first.
    pub fn rmtree(&self, path: &str) -> Result<()> {
        let stat = self.stat(path)?;
        if stat.mode != Mode::Directory {
            return self.remove(path);
        }
        let entries = self.list(path)?;
        for entry in entries {
            let child = pathutil::join(path, &entry.name, PATH_MAX).map_err(|_| ErrorKind::NameTooLong)?;
            self.rmtree(&child)?;
        }
        self.remove(path)
    }

    /// Pre-order traversal across mount boundaries. Returning `false`
    /// from `callback` stops the whole walk, successfully.
    pub fn walktree(&self, path: &str, callback: &mut dyn FnMut(&str, bool) -> bool) -> Result<()> {
        self.walktree_inner(path, callback)
    }

    fn walktree_inner(&self, path: &str, callback: &mut dyn FnMut(&str, bool) -> bool) -> Result<()> {
        let entries = self.list(path)?;
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
}

impl Default for UnionFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OpenFlags, SeekFrom};
    use alloc::collections::BTreeMap;
    use alloc::string::ToString;
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

    /// A flat mock backend (no real subdirectories below its own root),
    /// just rich enough to exercise mount resolution and cross-mount
    /// rename in isolation from the real RAM filesystem.
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
            Ok(())
        }

        fn opendir(&self, path: &str) -> Result<Box<dyn Dir>> {
            let dirs = self.dirs.lock();
            let mut names: Vec<String> = Vec::new();
            let prefix = if path == "/" { String::from("/") } else { alloc::format!("{}/", path) };
            for f in self.files.lock().keys() {
                if let Some(n) = f.strip_prefix(prefix.as_str()) {
                    if !n.is_empty() && !n.contains('/') {
                        names.push(n.to_string());
                    }
                }
            }
            if dirs.get(path).is_none() && path != "/" {
                return Err(ErrorKind::NoEntry);
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
            self.dirs.lock().remove(path);
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
            if path == "/" || self.dirs.lock().contains_key(path) {
                return Ok(Stat { size: 0, mtime: 0, mode: Mode::Directory });
            }
            Err(ErrorKind::NoEntry)
        }

        fn utime(&self, _path: &str, _mtime: u64) -> Result<()> {
            Err(ErrorKind::NotSupported)
        }
    }

    fn two_mount_fs() -> UnionFs {
        let mut fs = UnionFs::new();
        fs.mount("/", "/", Box::new(ToyBackend::new())).unwrap();
        fs.mkdir("/mnt").unwrap();
        let b = ToyBackend::new();
        b.mkdir("/home").unwrap();
        fs.mount("/mnt", "/home", Box::new(b)).unwrap();
        fs
    }

    #[test]
    fn longest_prefix_resolution_picks_inner_mount() {
        let fs = two_mount_fs();
        let (idx, _vpath, real) = fs.locate("/mnt/test.txt").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(real, "/home/test.txt");

        let (idx, _vpath, real) = fs.locate("/test.txt").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(real, "/test.txt");
    }

    #[test]
    fn mount_point_stat_is_synthetic_for_root_delegated_otherwise() {
        let fs = two_mount_fs();
        let root_stat = fs.stat("/").unwrap();
        assert_eq!(root_stat.mode, Mode::Directory);

        let mnt_stat = fs.stat("/mnt").unwrap();
        assert_eq!(mnt_stat.mode, Mode::Directory);
    }

    #[test]
    fn remove_refuses_mount_point() {
        let fs = two_mount_fs();
        assert_eq!(fs.remove("/mnt"), Err(ErrorKind::Busy));
    }

    #[test]
    fn umount_refuses_mount_with_submounts_and_cwd_mount() {
        let mut fs = two_mount_fs();
        assert_eq!(fs.umount("/"), Err(ErrorKind::Busy));
        fs.chdir("/mnt").unwrap();
        assert_eq!(fs.umount("/mnt"), Err(ErrorKind::Busy));
    }

    #[test]
    fn cross_mount_rename_copies_then_deletes() {
        let fs = two_mount_fs();
        let f = fs.open("/src.txt", OpenMode::Write).unwrap();
        let mut f = f;
        f.write(b"payload").unwrap();
        fs.close(f).unwrap();

        fs.rename("/src.txt", "/mnt/dst.txt").unwrap();

        assert_eq!(fs.stat("/src.txt"), Err(ErrorKind::NoEntry));
        let mut g = fs.open("/mnt/dst.txt", OpenMode::Read).unwrap();
        let mut buf = [0u8; 16];
        let n = g.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }
}
