//! Virtual file system: a backend contract plus two front-ends.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │           User Applications          │
//! └──────────────────┬───────────────────┘
//!                    │ open/read/write/close
//! ┌──────────────────▼───────────────────┐
//! │     SingleFs         │    UnionFs    │
//! │  one fixed backend   │  mount table  │
//! └──────────────────┬────┴──────┬───────┘
//!                    │ Backend trait
//! ┌─────────┬────────┴────────┬──────────┐
//! │  ramfs  │      romfs      │   ...    │
//! └─────────┴─────────────────┴──────────┘
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod backend;
pub mod single;
pub mod union;

pub use backend::{
    Backend, Dir, DirEntry, File, Mode, OpenFlags, OpenMode, SeekFrom, Stat, NAME_MAX, PATH_MAX,
};
pub use single::SingleFs;
pub use union::UnionFs;
