//! Mutual exclusion lock. Behaves like a binary [`crate::semaphore::Semaphore`]
//! that remembers who holds it: `unlock` from a fiber that isn't the
//! current holder returns *protocol* instead of releasing the lock.
//!
//! Priority inheritance is not implemented (see this crate's design
//! notes): a low-priority holder can still block a high-priority waiter
//! for as long as it holds the lock.

use alloc::collections::VecDeque;
use spin::Mutex as Spinlock;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, FiberId, ParkOutcome, Ticks, Wait};

struct State {
    locked: bool,
    holder: Option<FiberId>,
    waiters: VecDeque<FiberId>,
    destroyed: bool,
}

pub struct Mutex {
    inner: Spinlock<State>,
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: Spinlock::new(State {
                locked: false,
                holder: None,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn lock_with(&self, timeout: Wait) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if !state.locked {
                state.locked = true;
                state.holder = kernel::current_id();
                return Ok(());
            }
            if matches!(timeout, Wait::Poll) {
                return Err(ErrorKind::TimedOut);
            }
        }
        let me = kernel::current_id().ok_or(ErrorKind::Protocol)?;
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if !state.locked {
                state.locked = true;
                state.holder = Some(me);
                return Ok(());
            }
            state.waiters.push_back(me);
        }
        match kernel::park(timeout) {
            ParkOutcome::Canceled => Err(ErrorKind::Canceled),
            ParkOutcome::TimedOut => {
                let mut state = self.inner.lock();
                state.waiters.retain(|&w| w != me);
                Err(ErrorKind::TimedOut)
            }
            ParkOutcome::Woken => {
                let mut state = self.inner.lock();
                state.holder = Some(me);
                Ok(())
            }
        }
    }

    pub fn lock(&self) -> Result<()> {
        self.lock_with(Wait::Forever)
    }

    pub fn lock_timeout(&self, ticks: Ticks) -> Result<()> {
        self.lock_with(Wait::Timeout(ticks))
    }

    pub fn try_lock(&self) -> Result<()> {
        self.lock_with(Wait::Poll)
    }

    /// Non-blocking, interrupt-safe lock attempt. A mutex held by a
    /// fiber should normally only ever be contended from fiber context,
    /// but the entry point is provided for symmetry with the rest of
    /// the primitive family.
    pub fn lock_isr(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        if !state.locked {
            state.locked = true;
            state.holder = kernel::current_id();
            Ok(())
        } else {
            Err(ErrorKind::Again)
        }
    }

    /// Releases the lock. Returns *protocol* if the caller is not the
    /// current holder.
    pub fn unlock(&self) -> Result<()> {
        let me = kernel::current_id();
        let mut state = self.inner.lock();
        if !state.locked || state.holder != me {
            return Err(ErrorKind::Protocol);
        }
        loop {
            match kernel::pop_best_waiter(&mut state.waiters) {
                Some(next) => {
                    // The waiter's resume path in `lock_with` claims
                    // holdership for itself once woken; leave `holder`
                    // as-is until then so a third fiber calling
                    // `try_lock` in between still sees it taken. If
                    // `next` already timed out this pass, the hand-off
                    // didn't happen — falling through to the next
                    // waiter instead of leaving the mutex permanently
                    // locked with no holder able to release it.
                    if kernel::wake(next) {
                        return Ok(());
                    }
                }
                None => {
                    state.locked = false;
                    state.holder = None;
                    return Ok(());
                }
            }
        }
    }

    pub fn holder(&self) -> Option<FiberId> {
        self.inner.lock().holder
    }

    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        while let Some(id) = state.waiters.pop_front() {
            kernel::cancel(id);
        }
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new();
        assert!(m.try_lock().is_ok());
        assert_eq!(m.try_lock(), Err(ErrorKind::TimedOut));
    }

    #[test]
    fn unlock_by_non_holder_is_a_protocol_violation() {
        use crate::kernel;
        use alloc::sync::Arc;
        use core::sync::atomic::{AtomicBool, Ordering};

        fn stop_when_idle() -> i32 {
            1
        }

        kernel::init(Some(stop_when_idle));
        let m = Arc::new(Mutex::new());
        let saw_protocol = Arc::new(AtomicBool::new(false));

        let m_holder = m.clone();
        kernel::create(0, "holder", 16 * 1024, move || {
            m_holder.lock().unwrap();
            kernel::yield_now();
        })
        .unwrap();

        let m_other = m.clone();
        let saw_protocol_other = saw_protocol.clone();
        kernel::create(0, "other", 16 * 1024, move || {
            kernel::yield_now();
            saw_protocol_other.store(m_other.unlock() == Err(ErrorKind::Protocol), Ordering::SeqCst);
        })
        .unwrap();

        kernel::start_scheduler().unwrap();
        assert!(saw_protocol.load(Ordering::SeqCst));
    }

    #[test]
    fn destroy_cancels_state() {
        let m = Mutex::new();
        m.destroy();
        assert_eq!(m.try_lock(), Err(ErrorKind::Canceled));
    }
}
