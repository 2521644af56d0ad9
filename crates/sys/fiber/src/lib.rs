//! Cooperative, priority-scheduled fiber kernel.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                 start_scheduler             │
//! │   highest-priority ready fiber runs until    │
//! │   it yields, delays, blocks, or is suspended │
//! └──────────────────────┬───────────────────────┘
//!                        │ context::switch
//! ┌──────────┬───────────┼───────────┬──────────┐
//! │  event   │  signal   │  mutex    │   pool   │
//! │ semaphore│  mailbox  │  queue    │ channel  │
//! └──────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! A single global kernel instance owns every fiber; there is no
//! per-kernel handle to pass around, matching the library this module
//! generalises. All of the synchronisation primitives in this crate are
//! built on top of [`kernel::park`]/[`kernel::wake`] and share the same
//! three-form blocking contract: wait forever, wait with a timeout, or
//! poll once.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod context;
mod kernel;

pub mod channel;
pub mod event;
pub mod mailbox;
pub mod mutex;
pub mod pool;
pub mod queue;
pub mod semaphore;
pub mod signal;

pub use channel::Channel;
pub use event::{Event, Mode as EventMode};
pub use kernel::{
    create, current, delay, end_scheduler, init, is_initialized, name, resume, start_scheduler,
    state, suspend, yield_now, FiberId, FiberState, IdleHook, Ticks, PRIORITY_COUNT,
    TICKS_FOREVER,
};
pub use mailbox::{Mailbox, MailboxNode};
pub use mutex::Mutex;
pub use pool::{Pool, PoolBlock};
pub use queue::Queue;
pub use semaphore::Semaphore;
