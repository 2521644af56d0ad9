//! Fixed-size ring buffer of fixed-size items. `send_back`/`send_front`
//! copy one item in, blocking while full; `receive` copies one out from
//! the head, blocking while empty. A sender or receiver that finds the
//! other side already waiting hands its item across directly instead of
//! going through the ring, so the ring slot it would have used can't be
//! stolen by a third fiber between the wake and the resume.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, FiberId, ParkOutcome, Ticks, Wait};

struct State {
    buf: Vec<u8>,
    item_size: usize,
    capacity: usize,
    head: usize,
    count: usize,
    waiters_send: VecDeque<FiberId>,
    waiters_recv: VecDeque<FiberId>,
    destroyed: bool,
}

pub struct Queue {
    inner: Mutex<State>,
}

impl Queue {
    pub fn new(item_size: usize, capacity: usize) -> Queue {
        Queue {
            inner: Mutex::new(State {
                buf: vec![0u8; item_size * capacity],
                item_size,
                capacity,
                head: 0,
                count: 0,
                waiters_send: VecDeque::new(),
                waiters_recv: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn push_back(state: &mut State, item: &[u8]) {
        let tail = (state.head + state.count) % state.capacity;
        let off = tail * state.item_size;
        state.buf[off..off + state.item_size].copy_from_slice(item);
        state.count += 1;
    }

    fn push_front(state: &mut State, item: &[u8]) {
        state.head = (state.head + state.capacity - 1) % state.capacity;
        let off = state.head * state.item_size;
        state.buf[off..off + state.item_size].copy_from_slice(item);
        state.count += 1;
    }

    fn pop_into(state: &mut State, out: &mut [u8]) {
        let off = state.head * state.item_size;
        out.copy_from_slice(&state.buf[off..off + state.item_size]);
        state.head = (state.head + 1) % state.capacity;
        state.count -= 1;
    }

    /// Hands `item` straight to a waiting receiver if one is live, trying
    /// waiters in priority order until one actually wakes (a popped
    /// waiter whose timeout already fired this pass must not be treated
    /// as having received anything). Returns whether the hand-off
    /// happened; on `false` the ring is untouched and the caller falls
    /// back to its own enqueue/block logic.
    fn try_handoff_to_receiver(state: &mut State, item: &[u8]) -> bool {
        while let Some(id) = kernel::pop_best_waiter(&mut state.waiters_recv) {
            let dest = kernel::take_wake_payload(id) as *mut u8;
            if kernel::wake(id) {
                unsafe { core::ptr::copy_nonoverlapping(item.as_ptr(), dest, state.item_size) };
                return true;
            }
        }
        false
    }

    fn wake_one_sender(state: &mut State) {
        while let Some(id) = kernel::pop_best_waiter(&mut state.waiters_send) {
            let src = kernel::take_wake_payload(id) as *const u8;
            let front = kernel::take_result_bits(id) != 0;
            // Confirm the hand-off before copying the item in: if `id`
            // already timed out this pass, it never sees this wake, and
            // copying its item into the ring anyway would both duplicate
            // data (the sender's own timeout path reports failure) and
            // let a stale pointer write succeed where it shouldn't count.
            if !kernel::wake(id) {
                continue;
            }
            let item = unsafe { core::slice::from_raw_parts(src, state.item_size) };
            if front {
                Self::push_front(state, item);
            } else {
                Self::push_back(state, item);
            }
            return;
        }
    }

    fn send_with(&self, item: &[u8], front: bool, timeout: Wait) -> Result<()> {
        if item.len() != self.inner.lock().item_size {
            return Err(ErrorKind::Invalid);
        }
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if Self::try_handoff_to_receiver(&mut state, item) {
                return Ok(());
            }
            if state.count < state.capacity {
                if front {
                    Self::push_front(&mut state, item);
                } else {
                    Self::push_back(&mut state, item);
                }
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
            if Self::try_handoff_to_receiver(&mut state, item) {
                return Ok(());
            }
            if state.count < state.capacity {
                if front {
                    Self::push_front(&mut state, item);
                } else {
                    Self::push_back(&mut state, item);
                }
                return Ok(());
            }
            kernel::set_wake_payload(me, item.as_ptr() as usize);
            kernel::set_result_bits(me, if front { 1 } else { 0 });
            state.waiters_send.push_back(me);
        }
        match kernel::park(timeout) {
            ParkOutcome::Canceled => Err(ErrorKind::Canceled),
            ParkOutcome::TimedOut => {
                let mut state = self.inner.lock();
                state.waiters_send.retain(|&w| w != me);
                Err(ErrorKind::TimedOut)
            }
            ParkOutcome::Woken => Ok(()),
        }
    }

    pub fn send_back(&self, item: &[u8]) -> Result<()> {
        self.send_with(item, false, Wait::Forever)
    }

    pub fn send_back_timeout(&self, item: &[u8], ticks: Ticks) -> Result<()> {
        self.send_with(item, false, Wait::Timeout(ticks))
    }

    pub fn try_send_back(&self, item: &[u8]) -> Result<()> {
        self.send_with(item, false, Wait::Poll)
    }

    pub fn send_front(&self, item: &[u8]) -> Result<()> {
        self.send_with(item, true, Wait::Forever)
    }

    pub fn send_front_timeout(&self, item: &[u8], ticks: Ticks) -> Result<()> {
        self.send_with(item, true, Wait::Timeout(ticks))
    }

    pub fn try_send_front(&self, item: &[u8]) -> Result<()> {
        self.send_with(item, true, Wait::Poll)
    }

    pub fn send_back_isr(&self, item: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        if item.len() != state.item_size {
            return Err(ErrorKind::Invalid);
        }
        if Self::try_handoff_to_receiver(&mut state, item) {
            Ok(())
        } else if state.count < state.capacity {
            Self::push_back(&mut state, item);
            Ok(())
        } else {
            Err(ErrorKind::Again)
        }
    }

    fn receive_with(&self, out: &mut [u8], timeout: Wait) -> Result<()> {
        if out.len() != self.inner.lock().item_size {
            return Err(ErrorKind::Invalid);
        }
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if state.count > 0 {
                Self::pop_into(&mut state, out);
                Self::wake_one_sender(&mut state);
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
                Self::pop_into(&mut state, out);
                Self::wake_one_sender(&mut state);
                return Ok(());
            }
            kernel::set_wake_payload(me, out.as_mut_ptr() as usize);
            state.waiters_recv.push_back(me);
        }
        match kernel::park(timeout) {
            ParkOutcome::Canceled => Err(ErrorKind::Canceled),
            ParkOutcome::TimedOut => {
                let mut state = self.inner.lock();
                state.waiters_recv.retain(|&w| w != me);
                Err(ErrorKind::TimedOut)
            }
            ParkOutcome::Woken => Ok(()),
        }
    }

    pub fn receive(&self, out: &mut [u8]) -> Result<()> {
        self.receive_with(out, Wait::Forever)
    }

    pub fn receive_timeout(&self, out: &mut [u8], ticks: Ticks) -> Result<()> {
        self.receive_with(out, Wait::Timeout(ticks))
    }

    pub fn try_receive(&self, out: &mut [u8]) -> Result<()> {
        self.receive_with(out, Wait::Poll)
    }

    pub fn receive_isr(&self, out: &mut [u8]) -> Result<()> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        if out.len() != state.item_size {
            return Err(ErrorKind::Invalid);
        }
        if state.count == 0 {
            return Err(ErrorKind::Again);
        }
        Self::pop_into(&mut state, out);
        Self::wake_one_sender(&mut state);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        while let Some(id) = state.waiters_send.pop_front() {
            kernel::cancel(id);
        }
        while let Some(id) = state.waiters_recv.pop_front() {
            kernel::cancel(id);
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn send_back_then_receive_preserves_order() {
        let q = Queue::new(4, 2);
        q.try_send_back(&1u32.to_le_bytes()).unwrap();
        q.try_send_back(&2u32.to_le_bytes()).unwrap();
        let mut out = [0u8; 4];
        q.try_receive(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 1);
        q.try_receive(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 2);
    }

    #[test]
    fn send_front_jumps_the_line() {
        let q = Queue::new(4, 2);
        q.try_send_back(&1u32.to_le_bytes()).unwrap();
        q.try_send_front(&9u32.to_le_bytes()).unwrap();
        let mut out = [0u8; 4];
        q.try_receive(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 9);
    }

    #[test]
    fn full_queue_rejects_poll_send() {
        let q = Queue::new(4, 1);
        q.try_send_back(&1u32.to_le_bytes()).unwrap();
        assert_eq!(q.try_send_back(&2u32.to_le_bytes()), Err(ErrorKind::TimedOut));
    }

    #[test]
    fn empty_queue_rejects_poll_receive() {
        let q = Queue::new(4, 1);
        let mut out = [0u8; 4];
        assert_eq!(q.try_receive(&mut out), Err(ErrorKind::TimedOut));
    }

    #[test]
    fn wrong_item_size_is_invalid() {
        let q = Queue::new(4, 1);
        assert_eq!(q.try_send_back(&[0u8; 3]), Err(ErrorKind::Invalid));
    }
}
