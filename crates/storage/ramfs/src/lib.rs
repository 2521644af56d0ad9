//! Heap-backed, read-write filesystem backend.
//!
//! The directory tree is an arena of entries addressed by index rather
//! than by intrusive pointer, per the arena redesign this component's
//! design notes call out as an acceptable alternative to the original's
//! parent/sibling linked list. File *data*, the highest-volume
//! allocation, is still sub-allocated from a private pool over a
//! caller-supplied buffer, preserving the "no reliance on the global
//! allocator for file bytes" contract on constrained targets.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::boxed::Box;
use core::alloc::Layout;
use core::ptr::NonNull;

use spin::Mutex;
use linked_list_allocator::Heap;

use vfskit_error::{ErrorKind, Result};
use vfskit_vfs::{Backend, Dir, DirEntry, File, Mode, OpenFlags, OpenMode, SeekFrom, Stat, NAME_MAX};

const ROOT_INDEX: usize = 0;
const MIN_GROWTH: usize = 32;

/// A byte buffer sub-allocated from the filesystem's private pool. Grows
/// by x1.5 (minimum 32 bytes) on demand; frees its block back to the
/// pool on drop.
struct PoolBuf {
    heap: Arc<Mutex<Heap>>,
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

unsafe impl Send for PoolBuf {}

fn grow_target(cap: usize, needed: usize) -> usize {
    let mut c = cap.max(MIN_GROWTH);
    while c < needed {
        c = (c * 3) / 2 + 1;
    }
    c
}

impl PoolBuf {
    fn empty(heap: Arc<Mutex<Heap>>) -> Self {
        PoolBuf { heap, ptr: NonNull::dangling(), len: 0, cap: 0 }
    }

    fn as_slice(&self) -> &[u8] {
        if self.cap == 0 {
            &[]
        } else {
            unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.cap == 0 {
            &mut []
        } else {
            unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Grows the backing allocation to at least `new_cap`, copying the
    /// live bytes over. Leaves `self` untouched on allocation failure.
    fn grow_to(&mut self, new_cap: usize) -> core::result::Result<(), ()> {
        if new_cap <= self.cap {
            return Ok(());
        }
        let layout = Layout::array::<u8>(new_cap).map_err(|_| ())?;
        let new_ptr = self.heap.lock().allocate_first_fit(layout).map_err(|_| ())?;
        if self.len > 0 {
            unsafe { core::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len) };
        }
        if self.cap > 0 {
            let old_layout = Layout::array::<u8>(self.cap).unwrap();
            unsafe { self.heap.lock().deallocate(self.ptr, old_layout) };
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
        Ok(())
    }

    /// Sets the logical length, zero-filling any newly exposed bytes.
    /// Assumes `new_len <= self.cap`.
    fn set_len(&mut self, new_len: usize) {
        debug_assert!(new_len <= self.cap);
        if new_len > self.len {
            unsafe {
                core::ptr::write_bytes(self.ptr.as_ptr().add(self.len), 0, new_len - self.len);
            }
        }
        self.len = new_len;
    }

    fn truncate(&mut self) {
        self.len = 0;
    }

    /// Writes `buf` at `pos`, growing as needed. A write that cannot
    /// fully fit because the pool is exhausted is honoured partially:
    /// whatever capacity is reachable is written and the short count is
    /// returned, matching this filesystem's documented no-rollback
    /// behaviour on out-of-memory.
    fn write_at(&mut self, pos: usize, buf: &[u8]) -> Result<usize> {
        let wanted_end = pos.saturating_add(buf.len());
        if wanted_end > self.cap {
            let padded = grow_target(self.cap, wanted_end);
            if self.grow_to(padded).is_err() {
                let _ = self.grow_to(wanted_end);
            }
        }
        let writable = self.cap.saturating_sub(pos).min(buf.len());
        if writable == 0 {
            return Err(ErrorKind::NoMemory);
        }
        let new_len = (pos + writable).max(self.len);
        self.set_len(new_len);
        self.as_mut_slice()[pos..pos + writable].copy_from_slice(&buf[..writable]);
        Ok(writable)
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if self.cap > 0 {
            let layout = Layout::array::<u8>(self.cap).unwrap();
            unsafe { self.heap.lock().deallocate(self.ptr, layout) };
        }
    }
}

enum Kind {
    File { data: PoolBuf },
    Dir { children: Vec<usize> },
}

struct Entry {
    parent: Option<usize>,
    name: String,
    mtime: u64,
    kind: Kind,
}

struct Resolved {
    parent: usize,
    name: String,
    existing: Option<usize>,
}

struct Inner {
    heap: Arc<Mutex<Heap>>,
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    cwd: usize,
}

impl Inner {
    fn find_child(&self, dir: usize, name: &str) -> Option<usize> {
        match &self.entries[dir].as_ref()?.kind {
            Kind::Dir { children } => children
                .iter()
                .copied()
                .find(|&c| self.entries[c].as_ref().map(|e| e.name == name).unwrap_or(false)),
            Kind::File { .. } => None,
        }
    }

    /// Walks `path` (already absolute and dot-normalised by the caller)
    /// segment by segment from the root. A missing intermediate segment
    /// is an error; a missing trailing segment is reported via
    /// `existing: None` alongside the closest resolved parent, for
    /// `open`-with-create and `mkdir` to use.
    fn resolve(&self, path: &str) -> Result<Resolved> {
        let mut segments: Vec<&str> = Vec::new();
        let mut rest = path;
        while let Some((seg, next)) = vfskit_path::top(rest) {
            segments.push(seg);
            rest = next;
        }
        if segments.is_empty() {
            return Ok(Resolved { parent: ROOT_INDEX, name: String::new(), existing: Some(ROOT_INDEX) });
        }
        let last = segments.len() - 1;
        let mut current = ROOT_INDEX;
        for (i, seg) in segments.iter().enumerate() {
            if seg.len() > NAME_MAX {
                return Err(ErrorKind::NameTooLong);
            }
            if seg.contains(':') || seg.contains('\\') {
                return Err(ErrorKind::InvalidName);
            }
            if i == last {
                let existing = self.find_child(current, seg);
                return Ok(Resolved { parent: current, name: (*seg).to_string(), existing });
            }
            match self.find_child(current, seg) {
                Some(idx) => {
                    if !matches!(self.entries[idx].as_ref().unwrap().kind, Kind::Dir { .. }) {
                        return Err(ErrorKind::NotDirectory);
                    }
                    current = idx;
                }
                None => return Err(ErrorKind::NoEntry),
            }
        }
        unreachable!()
    }

    fn alloc_slot(&mut self, entry: Entry) -> usize {
        if let Some(idx) = self.free.pop() {
            self.entries[idx] = Some(entry);
            idx
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        }
    }

    fn attach(&mut self, parent: usize, child: usize) {
        if let Some(Entry { kind: Kind::Dir { children }, .. }) = &mut self.entries[parent] {
            children.push(child);
        }
    }

    fn detach(&mut self, parent: usize, child: usize) {
        if let Some(Entry { kind: Kind::Dir { children }, .. }) = &mut self.entries[parent] {
            children.retain(|&c| c != child);
        }
    }

    fn create_file(&mut self, parent: usize, name: String) -> usize {
        let idx = self.alloc_slot(Entry {
            parent: Some(parent),
            name,
            mtime: 0,
            kind: Kind::File { data: PoolBuf::empty(self.heap.clone()) },
        });
        self.attach(parent, idx);
        idx
    }

    fn create_dir(&mut self, parent: usize, name: String) -> usize {
        let idx = self.alloc_slot(Entry { parent: Some(parent), name, mtime: 0, kind: Kind::Dir { children: Vec::new() } });
        self.attach(parent, idx);
        idx
    }

    fn unlink(&mut self, idx: usize) {
        if let Some(parent) = self.entries[idx].as_ref().and_then(|e| e.parent) {
            self.detach(parent, idx);
        }
        self.entries[idx] = None;
        self.free.push(idx);
    }

    fn file_len(&self, idx: usize) -> Result<usize> {
        match &self.entries[idx].as_ref().ok_or(ErrorKind::Broken)?.kind {
            Kind::File { data } => Ok(data.len),
            Kind::Dir { .. } => Err(ErrorKind::IsDirectory),
        }
    }

    fn path_of(&self, mut idx: usize) -> String {
        let mut names: Vec<&str> = Vec::new();
        while let Some(entry) = self.entries[idx].as_ref() {
            match entry.parent {
                Some(p) => {
                    names.push(&entry.name);
                    idx = p;
                }
                None => break,
            }
        }
        if names.is_empty() {
            return String::from("/");
        }
        let mut out = String::new();
        for n in names.iter().rev() {
            out.push('/');
            out.push_str(n);
        }
        out
    }
}

/// A backend whose entire tree lives in a caller-supplied byte buffer.
/// Cloning shares the same tree (through the inner `Arc`); there is no
/// deep-copy constructor because the filesystem has no notion of two
/// independent views over one buffer.
pub struct RamFs {
    inner: Arc<Mutex<Inner>>,
}

impl RamFs {
    /// Builds an empty filesystem (just the root directory) backed by
    /// `buffer`, which must outlive every handle this filesystem issues.
    pub fn new(buffer: &'static mut [u8]) -> Self {
        let mut heap = Heap::empty();
        unsafe { heap.init(buffer.as_mut_ptr(), buffer.len()) };
        let root = Entry { parent: None, name: String::from("/"), mtime: 0, kind: Kind::Dir { children: Vec::new() } };
        RamFs {
            inner: Arc::new(Mutex::new(Inner {
                heap: Arc::new(Mutex::new(heap)),
                entries: alloc::vec![Some(root)],
                free: Vec::new(),
                cwd: ROOT_INDEX,
            })),
        }
    }
}

impl Backend for RamFs {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn File>> {
        let mut inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        let flags = mode.flags();
        let idx = match resolved.existing {
            Some(idx) => {
                if matches!(inner.entries[idx].as_ref().unwrap().kind, Kind::Dir { .. }) {
                    return Err(ErrorKind::IsDirectory);
                }
                if flags.contains(OpenFlags::TRUNCATE) {
                    if let Kind::File { data } = &mut inner.entries[idx].as_mut().unwrap().kind {
                        data.truncate();
                    }
                }
                idx
            }
            None => {
                if !mode.creates() {
                    return Err(ErrorKind::NoEntry);
                }
                inner.create_file(resolved.parent, resolved.name)
            }
        };
        let pos = if flags.contains(OpenFlags::APPEND) { inner.file_len(idx)? } else { 0 };
        Ok(Box::new(RamFile { inner: self.inner.clone(), entry: idx, pos, flags }))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        if resolved.existing.is_some() {
            return Err(ErrorKind::Exist);
        }
        inner.create_dir(resolved.parent, resolved.name);
        Ok(())
    }

    fn opendir(&self, path: &str) -> Result<Box<dyn Dir>> {
        let inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        let idx = resolved.existing.ok_or(ErrorKind::NoEntry)?;
        match &inner.entries[idx].as_ref().unwrap().kind {
            Kind::Dir { children } => {
                let names = children
                    .iter()
                    .map(|&c| inner.entries[c].as_ref().unwrap().name.clone())
                    .collect();
                Ok(Box::new(RamDir { names, idx: 0 }))
            }
            Kind::File { .. } => Err(ErrorKind::NotDirectory),
        }
    }

    fn chdir(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        let idx = resolved.existing.ok_or(ErrorKind::NoEntry)?;
        if !matches!(inner.entries[idx].as_ref().unwrap().kind, Kind::Dir { .. }) {
            return Err(ErrorKind::NotDirectory);
        }
        inner.cwd = idx;
        Ok(())
    }

    fn getcwd(&self, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let path = inner.path_of(inner.cwd);
        let bytes = path.as_bytes();
        if bytes.len() > buf.len() {
            return Err(ErrorKind::Range);
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        let idx = resolved.existing.ok_or(ErrorKind::NoEntry)?;
        if idx == ROOT_INDEX || idx == inner.cwd {
            return Err(ErrorKind::Busy);
        }
        if let Kind::Dir { children } = &inner.entries[idx].as_ref().unwrap().kind {
            if !children.is_empty() {
                return Err(ErrorKind::NotEmpty);
            }
        }
        inner.unlink(idx);
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let old = inner.resolve(old_path)?;
        let old_idx = old.existing.ok_or(ErrorKind::NoEntry)?;
        let new = inner.resolve(new_path)?;
        if new.existing.is_some() {
            return Err(ErrorKind::Exist);
        }
        inner.detach(old.parent, old_idx);
        if let Some(entry) = inner.entries[old_idx].as_mut() {
            entry.name = new.name;
            entry.parent = Some(new.parent);
        }
        inner.attach(new.parent, old_idx);
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        let inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        let idx = resolved.existing.ok_or(ErrorKind::NoEntry)?;
        let entry = inner.entries[idx].as_ref().unwrap();
        let (size, mode) = match &entry.kind {
            Kind::File { data } => (data.len as u64, Mode::Regular),
            Kind::Dir { .. } => (0, Mode::Directory),
        };
        Ok(Stat { size, mtime: entry.mtime, mode })
    }

    fn utime(&self, path: &str, mtime: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let resolved = inner.resolve(path)?;
        let idx = resolved.existing.ok_or(ErrorKind::NoEntry)?;
        inner.entries[idx].as_mut().unwrap().mtime = mtime;
        Ok(())
    }
}

struct RamFile {
    inner: Arc<Mutex<Inner>>,
    entry: usize,
    pos: usize,
    flags: OpenFlags,
}

impl File for RamFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(ErrorKind::Access);
        }
        let inner = self.inner.lock();
        let entry = inner.entries[self.entry].as_ref().ok_or(ErrorKind::Broken)?;
        let data = match &entry.kind {
            Kind::File { data } => data,
            Kind::Dir { .. } => return Err(ErrorKind::IsDirectory),
        };
        let slice = data.as_slice();
        if self.pos >= slice.len() {
            return Ok(0);
        }
        let n = (slice.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&slice[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(ErrorKind::Access);
        }
        let mut inner = self.inner.lock();
        if self.flags.contains(OpenFlags::APPEND) {
            self.pos = inner.file_len(self.entry)?;
        }
        let entry = inner.entries[self.entry].as_mut().ok_or(ErrorKind::Broken)?;
        let data = match &mut entry.kind {
            Kind::File { data } => data,
            Kind::Dir { .. } => return Err(ErrorKind::IsDirectory),
        };
        let n = data.write_at(self.pos, buf)?;
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: SeekFrom) -> Result<u64> {
        let inner = self.inner.lock();
        let len = inner.file_len(self.entry)?;
        drop(inner);
        let base = match whence {
            SeekFrom::Start => 0i64,
            SeekFrom::Current => self.pos as i64,
            SeekFrom::End => len as i64,
        };
        let new_pos = base.checked_add(offset).ok_or(ErrorKind::Range)?;
        if new_pos < 0 {
            return Err(ErrorKind::Invalid);
        }
        self.pos = new_pos as usize;
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

struct RamDir {
    names: Vec<String>,
    idx: usize,
}

impl Dir for RamDir {
    fn next(&mut self) -> Result<Option<DirEntry>> {
        if self.idx >= self.names.len() {
            return Ok(None);
        }
        let name = self.names[self.idx]
            .parse()
            .map_err(|_| ErrorKind::NameTooLong)?;
        self.idx += 1;
        Ok(Some(DirEntry { name }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
