//! Packed, read-only image filesystem backend.
//!
//! The image is a single immutable byte blob built by an external tool
//! ahead of time (see §6 of the upstream format description): a 4-byte
//! `"ROMF"` magic, a root directory entry at offset 4, and a tree of
//! further entries linked by byte offsets rather than pointers. Every
//! multi-byte field is little-endian regardless of host byte order,
//! since the image is meant to be generated once and shipped to targets
//! of either endianness.
//!
//! There is no per-instance mutable tree here: the only state this
//! backend owns is the current-directory offset, guarded by a lock so
//! that `Backend::chdir` can work through `&self`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};
use spin::Mutex;

use vfskit_error::{ErrorKind, Result};
use vfskit_vfs::{Backend, Dir, DirEntry, File, Mode, OpenMode, SeekFrom, Stat, NAME_MAX};

const MAGIC: &[u8; 4] = b"ROMF";
const ROOT_OFFSET: usize = 4;
const SENTINEL: u32 = 0xFFFF_FFFF;

const TYPE_DIR: u32 = 0;
const TYPE_FILE: u32 = 1;

// Shared 20-byte entry prefix.
const F_FLAGS: usize = 0;
const F_PARENT: usize = 4;
const F_SIBLING: usize = 8;
const F_NAME: usize = 12;
const F_MTIME: usize = 16;

// Directory entries append one field at +20; file entries append two.
const F_FIRST_CHILD: usize = 20;
const F_DATA_OFFSET: usize = 20;
const F_DATA_SIZE: usize = 24;

/// A read-only view over a ROM image's bytes, converting byte offsets to
/// decoded fields lazily and bounds-checking every access. Holds no
/// state of its own; every method takes the entry offset it operates on.
#[derive(Clone, Copy)]
struct Image<'a> {
    bytes: &'a [u8],
}

impl<'a> Image<'a> {
    fn u32_at(&self, offset: usize) -> Result<u32> {
        let field = self.bytes.get(offset..offset + 4).ok_or(ErrorKind::Broken)?;
        Ok(LittleEndian::read_u32(field))
    }

    fn offset_field(&self, offset: usize) -> Result<Option<usize>> {
        let v = self.u32_at(offset)?;
        if v == SENTINEL {
            Ok(None)
        } else {
            Ok(Some(v as usize))
        }
    }

    fn name(&self, entry: usize) -> Result<&'a str> {
        let name_offset = self.u32_at(entry + F_NAME)? as usize;
        let tail = self.bytes.get(name_offset..).ok_or(ErrorKind::Broken)?;
        let end = tail.iter().position(|&b| b == 0).ok_or(ErrorKind::Broken)?;
        core::str::from_utf8(&tail[..end]).map_err(|_| ErrorKind::Broken)
    }

    fn is_dir(&self, entry: usize) -> Result<bool> {
        Ok(self.u32_at(entry + F_FLAGS)? == TYPE_DIR)
    }

    fn mtime(&self, entry: usize) -> Result<u64> {
        Ok(self.u32_at(entry + F_MTIME)? as u64)
    }

    fn parent(&self, entry: usize) -> Result<Option<usize>> {
        self.offset_field(entry + F_PARENT)
    }

    fn sibling(&self, entry: usize) -> Result<Option<usize>> {
        self.offset_field(entry + F_SIBLING)
    }

    fn first_child(&self, entry: usize) -> Result<Option<usize>> {
        self.offset_field(entry + F_FIRST_CHILD)
    }

    fn data_offset(&self, entry: usize) -> Result<usize> {
        Ok(self.u32_at(entry + F_DATA_OFFSET)? as usize)
    }

    fn data_size(&self, entry: usize) -> Result<usize> {
        Ok(self.u32_at(entry + F_DATA_SIZE)? as usize)
    }

    fn data(&self, entry: usize) -> Result<&'a [u8]> {
        let start = self.data_offset(entry)?;
        let size = self.data_size(entry)?;
        self.bytes.get(start..start + size).ok_or(ErrorKind::Broken)
    }

    fn find_child(&self, dir: usize, name: &str) -> Result<Option<usize>> {
        let mut cursor = self.first_child(dir)?;
        while let Some(ent) = cursor {
            if self.name(ent)? == name {
                return Ok(Some(ent));
            }
            cursor = self.sibling(ent)?;
        }
        Ok(None)
    }

    /// Walks `path` segment by segment starting from `root` (absolute) or
    /// `cwd` (relative). Every segment, including the last, must exist:
    /// the ROM filesystem never creates anything, so there is no
    /// closest-parent fallback to report here.
    fn resolve(&self, root: usize, cwd: usize, path: &str) -> Result<usize> {
        if path.is_empty() {
            return Err(ErrorKind::InvalidName);
        }
        let mut current = if vfskit_path::is_absolute(path) { root } else { cwd };
        if vfskit_path::is_root(path) {
            return Ok(root);
        }
        let mut rest = path;
        while let Some((seg, next)) = vfskit_path::top(rest) {
            rest = next;
            if seg.len() > NAME_MAX {
                return Err(ErrorKind::NameTooLong);
            }
            if seg.contains(':') || seg.contains('\\') {
                return Err(ErrorKind::InvalidName);
            }
            if seg == "." {
                continue;
            }
            if seg == ".." {
                if current != root {
                    current = self.parent(current)?.unwrap_or(root);
                }
                continue;
            }
            if !self.is_dir(current)? {
                return Err(ErrorKind::NotDirectory);
            }
            current = self.find_child(current, seg)?.ok_or(ErrorKind::NoEntry)?;
        }
        Ok(current)
    }

    fn path_of(&self, root: usize, mut entry: usize) -> Result<String> {
        let mut names: Vec<&str> = Vec::new();
        while entry != root {
            names.push(self.name(entry)?);
            entry = self.parent(entry)?.ok_or(ErrorKind::Broken)?;
        }
        let mut out = String::new();
        if names.is_empty() {
            out.push('/');
            return Ok(out);
        }
        for n in names.iter().rev() {
            out.push('/');
            out.push_str(n);
        }
        Ok(out)
    }
}

/// A backend over a pre-built, immutable image blob. The bytes must
/// outlive every handle this filesystem issues, matching the lifetime
/// discipline [`vfskit_ramfs::RamFs`] uses for its own buffer.
pub struct RomFs {
    bytes: &'static [u8],
    root: usize,
    cwd: Mutex<usize>,
}

impl RomFs {
    /// Verifies the magic number and the root entry's shape (a directory
    /// named `"/"`), failing with `Protocol` if either check fails —
    /// mounting is itself the one fallible step for an otherwise
    /// immutable filesystem.
    pub fn new(bytes: &'static [u8]) -> Result<Self> {
        if bytes.len() < ROOT_OFFSET || &bytes[..4] != MAGIC {
            return Err(ErrorKind::Protocol);
        }
        let image = Image { bytes };
        if !image.is_dir(ROOT_OFFSET)? {
            return Err(ErrorKind::Protocol);
        }
        if image.name(ROOT_OFFSET)? != "/" {
            return Err(ErrorKind::Protocol);
        }
        Ok(RomFs { bytes, root: ROOT_OFFSET, cwd: Mutex::new(ROOT_OFFSET) })
    }

    fn image(&self) -> Image<'static> {
        Image { bytes: self.bytes }
    }
}

impl Backend for RomFs {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn File>> {
        let image = self.image();
        let entry = image.resolve(self.root, *self.cwd.lock(), path)?;
        if image.is_dir(entry)? {
            return Err(ErrorKind::IsDirectory);
        }
        if mode != OpenMode::Read {
            return Err(ErrorKind::Access);
        }
        let data = image.data(entry)?;
        Ok(Box::new(RomFile { data, pos: 0 }))
    }

    fn mkdir(&self, _path: &str) -> Result<()> {
        Err(ErrorKind::NotSupported)
    }

    fn opendir(&self, path: &str) -> Result<Box<dyn Dir>> {
        let image = self.image();
        let entry = image.resolve(self.root, *self.cwd.lock(), path)?;
        if !image.is_dir(entry)? {
            return Err(ErrorKind::NotDirectory);
        }
        Ok(Box::new(RomDir { bytes: self.bytes, cursor: image.first_child(entry)? }))
    }

    fn chdir(&self, path: &str) -> Result<()> {
        let image = self.image();
        let entry = image.resolve(self.root, *self.cwd.lock(), path)?;
        if !image.is_dir(entry)? {
            return Err(ErrorKind::NotDirectory);
        }
        *self.cwd.lock() = entry;
        Ok(())
    }

    fn getcwd(&self, buf: &mut [u8]) -> Result<usize> {
        let image = self.image();
        let path = image.path_of(self.root, *self.cwd.lock())?;
        let bytes = path.as_bytes();
        if bytes.len() > buf.len() {
            return Err(ErrorKind::Range);
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn remove(&self, _path: &str) -> Result<()> {
        Err(ErrorKind::NotSupported)
    }

    fn rename(&self, _old_path: &str, _new_path: &str) -> Result<()> {
        Err(ErrorKind::NotSupported)
    }

    fn stat(&self, path: &str) -> Result<Stat> {
        let image = self.image();
        let entry = image.resolve(self.root, *self.cwd.lock(), path)?;
        let mtime = image.mtime(entry)?;
        let (size, mode) = if image.is_dir(entry)? {
            (0, Mode::Directory)
        } else {
            (image.data_size(entry)? as u64, Mode::Regular)
        };
        Ok(Stat { size, mtime, mode })
    }

    fn utime(&self, _path: &str, _mtime: u64) -> Result<()> {
        Err(ErrorKind::NotSupported)
    }
}

struct RomFile {
    data: &'static [u8],
    pos: usize,
}

impl File for RomFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(ErrorKind::Access)
    }

    fn seek(&mut self, offset: i64, whence: SeekFrom) -> Result<u64> {
        let base = match whence {
            SeekFrom::Start => 0i64,
            SeekFrom::Current => self.pos as i64,
            SeekFrom::End => self.data.len() as i64,
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

struct RomDir {
    bytes: &'static [u8],
    cursor: Option<usize>,
}

impl Dir for RomDir {
    fn next(&mut self) -> Result<Option<DirEntry>> {
        let image = Image { bytes: self.bytes };
        match self.cursor {
            None => Ok(None),
            Some(ent) => {
                let name = image.name(ent)?.parse().map_err(|_| ErrorKind::NameTooLong)?;
                self.cursor = image.sibling(ent)?;
                Ok(Some(DirEntry { name }))
            }
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Builds a `ROMF` image blob in memory, for use by tests (and, outside
/// this crate, by any tool that wants to hand-assemble a small image
/// without shelling out to an external packer). Not part of the
/// backend's public surface: the format is normative, the builder is a
/// convenience.
#[cfg(test)]
mod image_builder {
    use alloc::string::String;
    use alloc::vec::Vec;

    const SENTINEL: u32 = 0xFFFF_FFFF;

    enum Node {
        Dir { name: String, children: Vec<Node> },
        File { name: String, data: Vec<u8> },
    }

    pub struct Builder {
        root: Vec<Node>,
    }

    impl Builder {
        pub fn new() -> Self {
            Builder { root: Vec::new() }
        }

        pub fn file(mut self, name: &str, data: &[u8]) -> Self {
            self.root.push(Node::File { name: String::from(name), data: data.into() });
            self
        }

        pub fn dir(mut self, name: &str, build: impl FnOnce(Builder) -> Builder) -> Self {
            let sub = build(Builder::new());
            self.root.push(Node::Dir { name: String::from(name), children: sub.root });
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(b"ROMF");
            let root = Node::Dir { name: String::from("/"), children: self.root };
            let mut names: Vec<(usize, Vec<u8>)> = Vec::new();
            let mut datas: Vec<(usize, Vec<u8>)> = Vec::new();
            layout(&root, None, &mut out, &mut names, &mut datas);
            out
        }
    }

    /// Lays out entries breadth-first-ish via direct recursion, patching
    /// in offsets after every block is placed since children need to
    /// know their parent's already-assigned offset.
    fn layout(
        node: &Node,
        _parent_offset: Option<u32>,
        out: &mut Vec<u8>,
        _names: &mut Vec<(usize, Vec<u8>)>,
        _datas: &mut Vec<(usize, Vec<u8>)>,
    ) {
        // Two-pass encoder: first reserve entry slots depth-first so every
        // offset is known before any cross-reference is written, then
        // patch fields in a second pass. Kept intentionally simple (this
        // only backs unit tests, not the on-target packer tool).
        struct Placed {
            offset: u32,
            is_dir: bool,
            name: Vec<u8>,
            children: Vec<usize>,
            data: Vec<u8>,
            parent: Option<usize>,
            sibling: Option<usize>,
        }

        fn flatten(node: &Node, parent: Option<usize>, placed: &mut Vec<Placed>) -> usize {
            match node {
                Node::Dir { name, children } => {
                    let idx = placed.len();
                    placed.push(Placed {
                        offset: 0,
                        is_dir: true,
                        name: name.as_bytes().to_vec(),
                        children: Vec::new(),
                        data: Vec::new(),
                        parent,
                        sibling: None,
                    });
                    let mut child_indices = Vec::new();
                    for c in children {
                        child_indices.push(flatten(c, Some(idx), placed));
                    }
                    for w in child_indices.windows(2) {
                        placed[w[0]].sibling = Some(w[1]);
                    }
                    placed[idx].children = child_indices;
                    idx
                }
                Node::File { name, data } => {
                    let idx = placed.len();
                    placed.push(Placed {
                        offset: 0,
                        is_dir: false,
                        name: name.as_bytes().to_vec(),
                        children: Vec::new(),
                        data: data.clone(),
                        parent,
                        sibling: None,
                    });
                    idx
                }
            }
        }

        let mut placed = Vec::new();
        flatten(node, None, &mut placed);

        // Entry sizes: dirs 24 bytes (20 + first_child), files 28 bytes
        // (20 + data_offset + data_size). Names and file data follow all
        // entries, in placement order.
        let header_start = 4u32;
        let mut offsets = alloc::vec![0u32; placed.len()];
        let mut cursor = header_start;
        for (i, p) in placed.iter().enumerate() {
            offsets[i] = cursor;
            cursor += if p.is_dir { 24 } else { 28 };
        }
        let mut name_offsets = alloc::vec![0u32; placed.len()];
        for (i, p) in placed.iter().enumerate() {
            name_offsets[i] = cursor;
            cursor += p.name.len() as u32 + 1;
        }
        let mut data_offsets = alloc::vec![0u32; placed.len()];
        for (i, p) in placed.iter().enumerate() {
            if !p.is_dir {
                data_offsets[i] = cursor;
                cursor += p.data.len() as u32;
            }
        }

        out.resize(cursor as usize, 0);
        for (i, p) in placed.iter().enumerate() {
            let off = offsets[i] as usize;
            let flags: u32 = if p.is_dir { 0 } else { 1 };
            write_u32(out, off, flags);
            write_u32(out, off + 4, p.parent.map(|pi| offsets[pi]).unwrap_or(SENTINEL));
            write_u32(out, off + 8, p.sibling.map(|si| offsets[si]).unwrap_or(SENTINEL));
            write_u32(out, off + 12, name_offsets[i]);
            write_u32(out, off + 16, 0); // mtime
            if p.is_dir {
                let first = p.children.first().map(|&ci| offsets[ci]).unwrap_or(SENTINEL);
                write_u32(out, off + 20, first);
            } else {
                write_u32(out, off + 20, data_offsets[i]);
                write_u32(out, off + 24, p.data.len() as u32);
            }
            let name_off = name_offsets[i] as usize;
            out[name_off..name_off + p.name.len()].copy_from_slice(&p.name);
            out[name_off + p.name.len()] = 0;
            if !p.is_dir {
                let data_off = data_offsets[i] as usize;
                out[data_off..data_off + p.data.len()].copy_from_slice(&p.data);
            }
        }
    }

    fn write_u32(out: &mut Vec<u8>, offset: usize, value: u32) {
        out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::image_builder::Builder;
    use super::*;

    fn sample_image() -> Vec<u8> {
        Builder::new()
            .file("foo.txt", b"Hello world")
            .dir("sub", |b| b.file("leaf.txt", b"leaf"))
            .build()
    }

    fn fs() -> RomFs {
        let bytes: &'static [u8] = sample_image().leak();
        RomFs::new(bytes).unwrap()
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes: &'static [u8] = alloc::vec![0u8; 16].leak();
        assert_eq!(RomFs::new(bytes), Err(ErrorKind::Protocol));
    }

    #[test]
    fn reads_file_bytes() {
        let fs = fs();
        let mut f = fs.open("/foo.txt", OpenMode::Read).unwrap();
        let mut buf = [0u8; 32];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello world");
    }

    #[test]
    fn write_mode_is_rejected() {
        let fs = fs();
        assert_eq!(fs.open("/foo.txt", OpenMode::Write).err(), Some(ErrorKind::Access));
    }

    #[test]
    fn opening_a_directory_is_rejected() {
        let fs = fs();
        assert_eq!(fs.open("/sub", OpenMode::Read).err(), Some(ErrorKind::IsDirectory));
    }

    #[test]
    fn readdir_walks_sibling_chain() {
        let fs = fs();
        let mut dir = fs.opendir("/").unwrap();
        let mut names: Vec<String> = Vec::new();
        while let Some(entry) = dir.next().unwrap() {
            names.push(String::from(entry.name.as_str()));
        }
        assert_eq!(names, alloc::vec!["foo.txt", "sub"]);
    }

    #[test]
    fn nested_file_reads_through_subdirectory() {
        let fs = fs();
        let mut f = fs.open("/sub/leaf.txt", OpenMode::Read).unwrap();
        let mut buf = [0u8; 8];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"leaf");
    }

    #[test]
    fn mutating_operations_are_not_supported() {
        let fs = fs();
        assert_eq!(fs.mkdir("/new"), Err(ErrorKind::NotSupported));
        assert_eq!(fs.remove("/foo.txt"), Err(ErrorKind::NotSupported));
        assert_eq!(fs.rename("/foo.txt", "/bar.txt"), Err(ErrorKind::NotSupported));
        assert_eq!(fs.utime("/foo.txt", 123), Err(ErrorKind::NotSupported));
    }

    #[test]
    fn chdir_and_getcwd_round_trip() {
        let fs = fs();
        fs.chdir("/sub").unwrap();
        let mut buf = [0u8; 64];
        let n = fs.getcwd(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"/sub");
    }

    #[test]
    fn seek_past_end_then_read_returns_zero_bytes() {
        let fs = fs();
        let mut f = fs.open("/foo.txt", OpenMode::Read).unwrap();
        f.seek(1000, SeekFrom::Start).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }
}
