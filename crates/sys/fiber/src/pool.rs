//! Fixed-block pool allocator. `get` pops a block from the free list or
//! blocks; `release` pushes a block back and, if anyone is waiting,
//! hands it straight to the highest-priority waiter instead of
//! returning it to the free list where a non-waiting fiber could steal
//! it first.
//!
//! Blocks are aligned to the platform's maximum alignment
//! (`core::mem::align_of::<usize>()`), matching the original library's
//! guarantee.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, ParkOutcome, Ticks, Wait};

/// A handle to one block handed out by a [`Pool`]. Not `Drop`-managed:
/// the caller must pass it back to [`Pool::release`], matching the
/// explicit get/release pairing of the library this is modeled on.
pub struct PoolBlock {
    ptr: *mut u8,
    len: usize,
}

impl PoolBlock {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn offset(&self, base: *mut u8) -> usize {
        self.ptr as usize - base as usize
    }
}

struct State {
    buffer: Vec<u8>,
    block_size: usize,
    free: VecDeque<usize>,
    waiters: VecDeque<kernel::FiberId>,
    destroyed: bool,
}

pub struct Pool {
    inner: Mutex<State>,
}

impl Pool {
    pub fn new(block_size: usize, block_count: usize) -> Pool {
        let align = core::mem::align_of::<usize>();
        let block_size = (block_size + align - 1) & !(align - 1);
        let buffer = vec![0u8; block_size * block_count];
        let mut free = VecDeque::with_capacity(block_count);
        for i in 0..block_count {
            free.push_back(i * block_size);
        }
        Pool {
            inner: Mutex::new(State {
                buffer,
                block_size,
                free,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn block_at(state: &mut State, offset: usize) -> PoolBlock {
        let ptr = unsafe { state.buffer.as_mut_ptr().add(offset) };
        PoolBlock { ptr, len: state.block_size }
    }

    fn get_with(&self, timeout: Wait) -> Result<PoolBlock> {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if let Some(off) = state.free.pop_front() {
                return Ok(Self::block_at(&mut state, off));
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
            if let Some(off) = state.free.pop_front() {
                return Ok(Self::block_at(&mut state, off));
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
                let offset = kernel::take_wake_payload(me);
                let mut state = self.inner.lock();
                Ok(Self::block_at(&mut state, offset))
            }
        }
    }

    pub fn get(&self) -> Result<PoolBlock> {
        self.get_with(Wait::Forever)
    }

    pub fn get_timeout(&self, ticks: Ticks) -> Result<PoolBlock> {
        self.get_with(Wait::Timeout(ticks))
    }

    pub fn try_get(&self) -> Result<PoolBlock> {
        self.get_with(Wait::Poll)
    }

    pub fn get_isr(&self) -> Result<PoolBlock> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        match state.free.pop_front() {
            Some(off) => Ok(Self::block_at(&mut state, off)),
            None => Err(ErrorKind::Again),
        }
    }

    pub fn release(&self, block: PoolBlock) {
        let mut state = self.inner.lock();
        let offset = block.offset(state.buffer.as_mut_ptr());
        loop {
            match kernel::pop_best_waiter(&mut state.waiters) {
                Some(id) => {
                    kernel::set_wake_payload(id, offset);
                    if kernel::wake(id) {
                        return;
                    }
                    // `id` timed out in this same pass; the payload we
                    // just stashed on it will never be read. Try the
                    // next waiter instead of leaking the block.
                }
                None => {
                    state.free.push_back(offset);
                    return;
                }
            }
        }
    }

    pub fn release_isr(&self, block: PoolBlock) {
        self.release(block)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
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
    fn get_and_release_round_trip() {
        let pool = Pool::new(16, 2);
        let mut a = pool.try_get().unwrap();
        a.as_mut_slice()[0] = 7;
        assert_eq!(pool.free_count(), 1);
        pool.release(a);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn exhausted_pool_reports_timed_out_on_poll() {
        let pool = Pool::new(8, 1);
        let _a = pool.try_get().unwrap();
        assert_eq!(pool.try_get().err(), Some(ErrorKind::TimedOut));
    }

    #[test]
    fn blocks_are_aligned_to_usize() {
        let pool = Pool::new(3, 4);
        let a = pool.try_get().unwrap();
        assert_eq!(a.ptr as usize % core::mem::align_of::<usize>(), 0);
    }

    #[test]
    fn get_isr_reports_again_when_empty() {
        let pool = Pool::new(8, 0);
        assert_eq!(pool.get_isr().err(), Some(ErrorKind::Again));
    }
}
