//! The 16-operation contract every filesystem backend satisfies.

use alloc::boxed::Box;
use vfskit_error::Result;

/// Upper bound on a single directory/file name, in bytes.
pub const NAME_MAX: usize = 255;

/// Upper bound on a full path, in bytes. Backends and front-ends use this
/// as the default buffer size for `getcwd` and for recursion depth limits
/// in the recursive tree helpers.
pub const PATH_MAX: usize = 260;

/// One of the six open-mode combinations, or `Unknown` for an
/// unrecognised mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `"r"` - read an existing file.
    Read,
    /// `"r+"` - read and write an existing file.
    ReadPlus,
    /// `"w"` - create or truncate, then write.
    Write,
    /// `"w+"` - create or truncate, then read and write.
    WritePlus,
    /// `"a"` - create if missing, write only at the end.
    Append,
    /// `"a+"` - create if missing, read anywhere, write only at the end.
    AppendPlus,
    /// Not one of the six recognised strings.
    Unknown,
}

bitflags::bitflags! {
    /// The flag combination a given [`OpenMode`] implies. Kept as a
    /// distinct type (rather than branching on `OpenMode` itself)
    /// because backends branch on flags, not on which string the caller
    /// used to name them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const TRUNCATE = 1 << 3;
    }
}

impl OpenMode {
    /// Parses one of the six convenience strings (`"r"`, `"r+"`, `"w"`,
    /// `"w+"`, `"a"`, `"a+"`), with an optional trailing `b` (binary mode
    /// is not distinguished from text mode on this target and is simply
    /// accepted and ignored). Anything else maps to `Unknown`.
    pub fn from_str(s: &str) -> OpenMode {
        let trimmed = s.strip_suffix('b').unwrap_or(s);
        match trimmed {
            "r" => OpenMode::Read,
            "r+" => OpenMode::ReadPlus,
            "w" => OpenMode::Write,
            "w+" => OpenMode::WritePlus,
            "a" => OpenMode::Append,
            "a+" => OpenMode::AppendPlus,
            _ => OpenMode::Unknown,
        }
    }

    /// The flag combination this mode implies.
    pub const fn flags(self) -> OpenFlags {
        match self {
            OpenMode::Read => OpenFlags::READ,
            OpenMode::ReadPlus => OpenFlags::READ.union(OpenFlags::WRITE),
            OpenMode::Write => OpenFlags::WRITE.union(OpenFlags::TRUNCATE),
            OpenMode::WritePlus => {
                OpenFlags::READ.union(OpenFlags::WRITE).union(OpenFlags::TRUNCATE)
            }
            OpenMode::Append => OpenFlags::WRITE.union(OpenFlags::APPEND),
            OpenMode::AppendPlus => {
                OpenFlags::READ.union(OpenFlags::WRITE).union(OpenFlags::APPEND)
            }
            OpenMode::Unknown => OpenFlags::empty(),
        }
    }

    /// True for the modes that create the file if it does not already
    /// exist (every mode but the two plain-read forms).
    pub const fn creates(self) -> bool {
        matches!(
            self,
            OpenMode::Write | OpenMode::WritePlus | OpenMode::Append | OpenMode::AppendPlus
        )
    }
}

/// Origin for a `seek` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start,
    Current,
    End,
}

/// What kind of node a [`Stat`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Regular,
    Directory,
}

/// The metadata record returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub mtime: u64,
    pub mode: Mode,
}

/// One entry produced by a directory iteration. The name is a bounded
/// string rather than a heap-growable one, matching the data model's
/// "name: bounded string (<= NAME_MAX bytes)" shape for a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: heapless::String<NAME_MAX>,
}

/// A handle to an open file. Exclusive ownership moves to the caller on
/// `Backend::open`. The handle closes itself — it carries whatever
/// back-reference to its owning backend it needs internally, the way the
/// open file handle's "back-pointer to its filesystem" is described in
/// the data model — so the front-end that asked for it never needs to
/// know which backend produced it in order to give it back.
pub trait File: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, offset: i64, whence: SeekFrom) -> Result<u64>;
    fn tell(&self) -> Result<u64>;
    fn flush(&mut self) -> Result<()>;
    /// Closes the handle. Consuming `self` makes double-close a compile
    /// error rather than a runtime hazard.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A handle to an open directory iteration. Closes itself, symmetric to
/// [`File`].
pub trait Dir: Send {
    /// Returns the next entry, or `None` once exhausted. Mirrors the
    /// "readdir returns entries, then a terminating null result"
    /// contract from a Rust-native `Option` rather than a sentinel.
    fn next(&mut self) -> Result<Option<DirEntry>>;
    fn close(self: Box<Self>) -> Result<()>;
}

/// The contract a filesystem implementation satisfies: the 16 operations
/// named in the system overview (close and closedir are satisfied by
/// [`File::close`] and [`Dir::close`] on the handles this trait's `open`
/// and `opendir` hand out). A backend that does not implement an
/// optional operation returns `ErrorKind::NotSupported` from it; the
/// front-ends require only open/close/read/opendir/readdir/closedir/stat
/// to be genuinely implemented for tree copy and walk to succeed.
pub trait Backend: Send + Sync {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn File>>;
    fn mkdir(&self, path: &str) -> Result<()>;
    fn opendir(&self, path: &str) -> Result<Box<dyn Dir>>;

    fn chdir(&self, path: &str) -> Result<()>;
    fn getcwd(&self, buf: &mut [u8]) -> Result<usize>;

    fn remove(&self, path: &str) -> Result<()>;
    fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;
    fn stat(&self, path: &str) -> Result<Stat>;
    fn utime(&self, path: &str, mtime: u64) -> Result<()>;

    /// True if `path` names an existing entry.
    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_parsing_matches_convenience_strings() {
        assert_eq!(OpenMode::from_str("r"), OpenMode::Read);
        assert_eq!(OpenMode::from_str("r+"), OpenMode::ReadPlus);
        assert_eq!(OpenMode::from_str("w"), OpenMode::Write);
        assert_eq!(OpenMode::from_str("w+b"), OpenMode::WritePlus);
        assert_eq!(OpenMode::from_str("a"), OpenMode::Append);
        assert_eq!(OpenMode::from_str("a+"), OpenMode::AppendPlus);
        assert_eq!(OpenMode::from_str("x"), OpenMode::Unknown);
    }

    #[test]
    fn write_mode_truncates_and_creates() {
        let flags = OpenMode::Write.flags();
        assert!(flags.contains(OpenFlags::WRITE) && flags.contains(OpenFlags::TRUNCATE));
        assert!(!flags.contains(OpenFlags::READ));
        assert!(OpenMode::Write.creates());
        assert!(!OpenMode::Read.creates());
    }
}
