//! Counting semaphore. `take` decrements or blocks; `give` increments
//! and, if anyone is waiting, immediately hands the count back to the
//! highest-priority (earliest-queued among ties) waiter instead of
//! leaving it for whichever fiber happens to run next.

use alloc::collections::VecDeque;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, FiberId, ParkOutcome, Ticks, Wait};

struct State {
    count: u32,
    waiters: VecDeque<FiberId>,
    destroyed: bool,
}

pub struct Semaphore {
    inner: Mutex<State>,
}

impl Semaphore {
    pub fn new(initial: u32) -> Semaphore {
        Semaphore {
            inner: Mutex::new(State {
                count: initial,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn take_with(&self, timeout: Wait) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if state.count > 0 {
                state.count -= 1;
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
            if state.count > 0 {
                state.count -= 1;
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
            ParkOutcome::Woken => Ok(()),
        }
    }

    pub fn take(&self) -> Result<()> {
        self.take_with(Wait::Forever)
    }

    pub fn take_timeout(&self, ticks: Ticks) -> Result<()> {
        self.take_with(Wait::Timeout(ticks))
    }

    pub fn try_take(&self) -> Result<()> {
        self.take_with(Wait::Poll)
    }

    /// Non-blocking, interrupt-safe take: never parks, reports *again*
    /// instead of *timed-out* when the count is already zero.
    pub fn take_isr(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        if state.count > 0 {
            state.count -= 1;
            Ok(())
        } else {
            Err(ErrorKind::Again)
        }
    }

    pub fn give(&self) {
        let mut state = self.inner.lock();
        loop {
            match kernel::pop_best_waiter(&mut state.waiters) {
                Some(id) => {
                    // Hand the unit straight to the waiter instead of
                    // incrementing count and letting it race a fresh
                    // taker. If `id`'s timeout already fired this pass,
                    // the hand-off didn't happen; try the next waiter
                    // rather than losing the unit.
                    if kernel::wake(id) {
                        return;
                    }
                }
                None => {
                    state.count += 1;
                    return;
                }
            }
        }
    }

    pub fn give_isr(&self) {
        self.give()
    }

    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }

    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        while let Some(id) = state.waiters.pop_front() {
            kernel::cancel(id);
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn take_decrements_and_try_take_fails_at_zero() {
        let sem = Semaphore::new(1);
        assert!(sem.try_take().is_ok());
        assert_eq!(sem.try_take(), Err(ErrorKind::TimedOut));
    }

    #[test]
    fn give_restores_a_unit_for_the_next_take() {
        let sem = Semaphore::new(0);
        sem.give();
        assert!(sem.try_take().is_ok());
    }

    #[test]
    fn take_isr_reports_again_not_timed_out() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.take_isr(), Err(ErrorKind::Again));
    }

    #[test]
    fn destroy_cancels_pending_takers_state() {
        let sem = Semaphore::new(0);
        sem.destroy();
        assert_eq!(sem.try_take(), Err(ErrorKind::Canceled));
    }
}
