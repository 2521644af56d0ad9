//! Per-fiber signal: the same any/all-bits wait as [`crate::event::Event`],
//! but the bit state lives on the target fiber instead of a separate
//! object, so there is nothing to create or destroy. A fiber only ever
//! waits on its own signal; any fiber (or interrupt handler) may raise
//! one directed at it.

use vfskit_error::Result;

use crate::event::Mode;
use crate::kernel::{self, FiberId, Ticks, Wait};

/// Blocks the caller until its own signal bits satisfy `pattern` under
/// `mode`, returning the bit snapshot captured at the moment of success.
pub fn wait(mode: Mode, pattern: u32, clear_on_exit: bool) -> Result<u32> {
    kernel::signal_wait(mode == Mode::And, pattern, clear_on_exit, Wait::Forever)
}

pub fn wait_timeout(mode: Mode, pattern: u32, clear_on_exit: bool, ticks: Ticks) -> Result<u32> {
    kernel::signal_wait(mode == Mode::And, pattern, clear_on_exit, Wait::Timeout(ticks))
}

pub fn try_wait(mode: Mode, pattern: u32, clear_on_exit: bool) -> Result<u32> {
    kernel::signal_wait(mode == Mode::And, pattern, clear_on_exit, Wait::Poll)
}

/// Ors `bits` into `target`'s signal state and wakes it if it was
/// blocked waiting on a now-satisfied pattern.
pub fn raise(target: FiberId, bits: u32) -> Result<()> {
    kernel::signal_raise(target, bits)
}

pub fn raise_isr(target: FiberId, bits: u32) -> Result<()> {
    kernel::signal_raise_isr(target, bits)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::kernel;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn stop_when_idle() -> i32 {
        1
    }

    #[test]
    fn raise_wakes_a_waiting_fiber_with_the_pattern() {
        kernel::init(Some(stop_when_idle));
        let observed = Arc::new(AtomicU32::new(0));
        let observed_in_fiber = observed.clone();
        let waiter = kernel::create(0, "waiter", 16 * 1024, move || {
            let got = wait(Mode::Or, 0x4, false).unwrap();
            observed_in_fiber.store(got, Ordering::SeqCst);
        })
        .unwrap();
        kernel::create(0, "raiser", 16 * 1024, move || {
            raise(waiter, 0x4).unwrap();
        })
        .unwrap();
        kernel::start_scheduler().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 0x4);
    }
}
