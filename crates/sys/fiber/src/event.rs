//! Bit-pattern event object.
//!
//! Waiters can ask for any-of (`Mode::Or`) or all-of (`Mode::And`) a set
//! of bits, optionally clearing the bits that satisfied them on the way
//! out. `set` ORs new bits in and wakes every waiter its new state
//! satisfies, not just the head.

use alloc::collections::VecDeque;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, FiberId, Ticks, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Or,
    And,
}

struct Waiter {
    id: FiberId,
    pattern: u32,
    and_mode: bool,
    clear_on_exit: bool,
}

struct State {
    bits: u32,
    waiters: VecDeque<Waiter>,
    destroyed: bool,
}

pub struct Event {
    inner: Mutex<State>,
}

impl Event {
    pub fn new() -> Event {
        Event {
            inner: Mutex::new(State {
                bits: 0,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn check(state: &State, mode: Mode, pattern: u32) -> Option<u32> {
        let satisfied = match mode {
            Mode::Or => state.bits & pattern != 0,
            Mode::And => state.bits & pattern == pattern,
        };
        if satisfied { Some(state.bits) } else { None }
    }

    fn wait_with(&self, mode: Mode, pattern: u32, clear_on_exit: bool, timeout: Wait) -> Result<u32> {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if let Some(v) = Self::check(&state, mode, pattern) {
                if clear_on_exit {
                    state.bits &= !pattern;
                }
                return Ok(v);
            }
            if matches!(timeout, Wait::Poll) {
                return Err(ErrorKind::TimedOut);
            }
        }
        // Only a real blocking wait needs to know which fiber is calling;
        // the already-satisfied and polling paths above never touch it.
        let me = kernel::current_id().ok_or(ErrorKind::Protocol)?;
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if let Some(v) = Self::check(&state, mode, pattern) {
                if clear_on_exit {
                    state.bits &= !pattern;
                }
                return Ok(v);
            }
            state.waiters.push_back(Waiter {
                id: me,
                pattern,
                and_mode: mode == Mode::And,
                clear_on_exit,
            });
        }
        match kernel::park(timeout) {
            kernel::ParkOutcome::Canceled => Err(ErrorKind::Canceled),
            kernel::ParkOutcome::TimedOut => {
                let mut state = self.inner.lock();
                state.waiters.retain(|w| w.id != me);
                Err(ErrorKind::TimedOut)
            }
            kernel::ParkOutcome::Woken => Ok(kernel::take_result_bits(me)),
        }
    }

    pub fn wait(&self, mode: Mode, pattern: u32, clear_on_exit: bool) -> Result<u32> {
        self.wait_with(mode, pattern, clear_on_exit, Wait::Forever)
    }

    pub fn wait_timeout(&self, mode: Mode, pattern: u32, clear_on_exit: bool, ticks: Ticks) -> Result<u32> {
        self.wait_with(mode, pattern, clear_on_exit, Wait::Timeout(ticks))
    }

    pub fn try_wait(&self, mode: Mode, pattern: u32, clear_on_exit: bool) -> Result<u32> {
        self.wait_with(mode, pattern, clear_on_exit, Wait::Poll)
    }

    /// Ors `bits` into the current value, then wakes every waiter the new
    /// value satisfies (not only the first). Safe to call from interrupt
    /// context: nothing here ever switches fibers.
    pub fn set(&self, bits: u32) {
        let mut state = self.inner.lock();
        state.bits |= bits;
        let mut still = VecDeque::new();
        while let Some(w) = state.waiters.pop_front() {
            let satisfied = if w.and_mode {
                state.bits & w.pattern == w.pattern
            } else {
                state.bits & w.pattern != 0
            };
            if satisfied {
                let snapshot = state.bits;
                kernel::set_result_bits(w.id, snapshot);
                // Only commit the clear-on-exit once the wake actually
                // lands: if `w.id` already timed out this pass, it will
                // never read `snapshot`, and clearing the bits anyway
                // would silently discard them for everyone else.
                if kernel::wake(w.id) {
                    if w.clear_on_exit {
                        state.bits &= !w.pattern;
                    }
                } else {
                    still.push_back(w);
                }
            } else {
                still.push_back(w);
            }
        }
        state.waiters = still;
    }

    pub fn set_isr(&self, bits: u32) {
        self.set(bits)
    }

    /// ANDs the complement of `bits` into current, returning the value
    /// from just before the clear.
    pub fn clear(&self, bits: u32) -> u32 {
        let mut state = self.inner.lock();
        let before = state.bits;
        state.bits &= !bits;
        before
    }

    pub fn clear_isr(&self, bits: u32) -> u32 {
        self.clear(bits)
    }

    pub fn get(&self) -> u32 {
        self.inner.lock().bits
    }

    /// Wakes every waiter with *canceled* and marks the event destroyed;
    /// further waits return *canceled* immediately.
    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        while let Some(w) = state.waiters.pop_front() {
            kernel::cancel(w.id);
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::kernel;

    fn reinit() {
        kernel::init(None);
    }

    #[test]
    fn set_then_wait_or_succeeds_immediately() {
        reinit();
        let ev = Event::new();
        ev.set(0x01);
        assert_eq!(ev.try_wait(Mode::Or, 0x01, false).unwrap(), 0x01);
    }

    #[test]
    fn wait_and_blocks_until_all_bits_present() {
        reinit();
        let ev = Event::new();
        ev.set(0x10);
        assert!(matches!(ev.try_wait(Mode::And, 0x11, false), Err(ErrorKind::TimedOut)));
        ev.set(0x01);
        assert_eq!(ev.try_wait(Mode::And, 0x11, false).unwrap(), 0x11);
    }

    #[test]
    fn clear_on_exit_consumes_the_satisfied_bits() {
        reinit();
        let ev = Event::new();
        ev.set(0x13);
        let result = ev.try_wait(Mode::And, 0x13, true).unwrap();
        assert_eq!(result, 0x13);
        assert_eq!(ev.get(), 0x00);
    }

    #[test]
    fn destroy_cancels_waiters() {
        reinit();
        let ev = Event::new();
        ev.destroy();
        assert_eq!(ev.try_wait(Mode::Or, 0x1, false), Err(ErrorKind::Canceled));
    }
}
