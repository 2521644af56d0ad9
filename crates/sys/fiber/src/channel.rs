//! Byte-ring channel of variable-size items. Every item is stored with a
//! 4-byte little-endian length prefix; only append-to-tail / consume-
//! from-head is supported, unlike [`crate::queue::Queue`] there is no
//! front insertion. A sender that finds a receiver already waiting
//! copies straight into that receiver's destination buffer instead of
//! writing the ring and hoping the waiter wins the race to read it back.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, FiberId, ParkOutcome, Ticks, Wait};

const LEN_PREFIX: usize = 4;

struct State {
    buf: Vec<u8>,
    capacity: usize,
    max_item_size: usize,
    head: usize,
    used: usize,
    waiters_send: VecDeque<FiberId>,
    waiters_recv: VecDeque<FiberId>,
    destroyed: bool,
}

pub struct Channel {
    inner: Mutex<State>,
}

impl Channel {
    pub fn new(capacity: usize, max_item_size: usize) -> Channel {
        Channel {
            inner: Mutex::new(State {
                buf: vec![0u8; capacity],
                capacity,
                max_item_size,
                head: 0,
                used: 0,
                waiters_send: VecDeque::new(),
                waiters_recv: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn write_bytes(state: &mut State, data: &[u8]) {
        let cap = state.capacity;
        let tail = (state.head + state.used) % cap;
        for (i, &b) in data.iter().enumerate() {
            state.buf[(tail + i) % cap] = b;
        }
        state.used += data.len();
    }

    fn read_bytes(state: &mut State, len: usize) -> Vec<u8> {
        let cap = state.capacity;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(state.buf[(state.head + i) % cap]);
        }
        state.head = (state.head + len) % cap;
        state.used -= len;
        out
    }

    fn enqueue(state: &mut State, item: &[u8]) {
        Self::write_bytes(state, &(item.len() as u32).to_le_bytes());
        Self::write_bytes(state, item);
    }

    fn peek_len(state: &State) -> Option<usize> {
        if state.used < LEN_PREFIX {
            return None;
        }
        let cap = state.capacity;
        let mut len_bytes = [0u8; LEN_PREFIX];
        for i in 0..LEN_PREFIX {
            len_bytes[i] = state.buf[(state.head + i) % cap];
        }
        Some(u32::from_le_bytes(len_bytes) as usize)
    }

    fn dequeue(state: &mut State, out: &mut [u8]) -> Result<usize> {
        let len = match Self::peek_len(state) {
            Some(l) => l,
            None => return Err(ErrorKind::Again),
        };
        if out.len() < len {
            return Err(ErrorKind::Range);
        }
        let _prefix = Self::read_bytes(state, LEN_PREFIX);
        let bytes = Self::read_bytes(state, len);
        out[..len].copy_from_slice(&bytes);
        Ok(len)
    }

    fn free_bytes(state: &State) -> usize {
        state.capacity - state.used
    }

    /// Hands `item` straight to a waiting receiver whose destination is
    /// large enough, trying waiters in priority order. A popped waiter
    /// whose timeout already fired this pass never sees the copy, so its
    /// cap is left unclaimed and the next waiter is tried instead of
    /// losing the item. Returns whether the hand-off happened.
    fn try_handoff_to_receiver(state: &mut State, item: &[u8]) -> bool {
        loop {
            match kernel::pop_best_waiter(&mut state.waiters_recv) {
                Some(id) => {
                    let cap = kernel::take_result_bits(id) as usize;
                    if cap < item.len() {
                        state.waiters_recv.push_front(id);
                        return false;
                    }
                    let dest_ptr = kernel::take_wake_payload(id) as *mut u8;
                    if kernel::wake(id) {
                        let dest = unsafe { core::slice::from_raw_parts_mut(dest_ptr, item.len()) };
                        dest.copy_from_slice(item);
                        kernel::set_result_bits(id, item.len() as u32);
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    fn send_with(&self, item: &[u8], timeout: Wait) -> Result<()> {
        let needed = LEN_PREFIX + item.len();
        {
            let state = self.inner.lock();
            if item.len() > state.max_item_size || needed > state.capacity {
                return Err(ErrorKind::Range);
            }
        }
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if Self::try_handoff_to_receiver(&mut state, item) {
                return Ok(());
            }
            if Self::free_bytes(&state) >= needed {
                Self::enqueue(&mut state, item);
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
            if Self::free_bytes(&state) >= needed {
                Self::enqueue(&mut state, item);
                return Ok(());
            }
            kernel::set_wake_payload(me, item.as_ptr() as usize);
            kernel::set_result_bits(me, item.len() as u32);
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

    pub fn send(&self, item: &[u8]) -> Result<()> {
        self.send_with(item, Wait::Forever)
    }

    pub fn send_timeout(&self, item: &[u8], ticks: Ticks) -> Result<()> {
        self.send_with(item, Wait::Timeout(ticks))
    }

    pub fn try_send(&self, item: &[u8]) -> Result<()> {
        self.send_with(item, Wait::Poll)
    }

    pub fn send_isr(&self, item: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        if item.len() > state.max_item_size {
            return Err(ErrorKind::Range);
        }
        let needed = LEN_PREFIX + item.len();
        if needed > state.capacity {
            return Err(ErrorKind::Range);
        }
        if Self::free_bytes(&state) >= needed {
            Self::enqueue(&mut state, item);
            Ok(())
        } else {
            Err(ErrorKind::Again)
        }
    }

    fn receive_with(&self, out: &mut [u8], timeout: Wait) -> Result<usize> {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if state.used >= LEN_PREFIX {
                match Self::dequeue(&mut state, out) {
                    Ok(n) => {
                        Self::drain_one_sender(&mut state);
                        return Ok(n);
                    }
                    Err(e) => return Err(e),
                }
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
            if state.used >= LEN_PREFIX {
                match Self::dequeue(&mut state, out) {
                    Ok(n) => {
                        Self::drain_one_sender(&mut state);
                        return Ok(n);
                    }
                    Err(e) => return Err(e),
                }
            }
            kernel::set_wake_payload(me, out.as_mut_ptr() as usize);
            kernel::set_result_bits(me, out.len() as u32);
            state.waiters_recv.push_back(me);
        }
        match kernel::park(timeout) {
            ParkOutcome::Canceled => Err(ErrorKind::Canceled),
            ParkOutcome::TimedOut => {
                let mut state = self.inner.lock();
                state.waiters_recv.retain(|&w| w != me);
                Err(ErrorKind::TimedOut)
            }
            ParkOutcome::Woken => Ok(kernel::take_result_bits(me) as usize),
        }
    }

    fn drain_one_sender(state: &mut State) {
        loop {
            match kernel::pop_best_waiter(&mut state.waiters_send) {
                Some(id) => {
                    let len = kernel::take_result_bits(id) as usize;
                    let needed = LEN_PREFIX + len;
                    if Self::free_bytes(state) < needed {
                        state.waiters_send.push_front(id);
                        return;
                    }
                    let src = kernel::take_wake_payload(id) as *const u8;
                    // Confirm the hand-off before enqueuing: if `id`
                    // already timed out this pass, it never sees this
                    // wake and its item must not be written in twice.
                    if !kernel::wake(id) {
                        continue;
                    }
                    let item = unsafe { core::slice::from_raw_parts(src, len) };
                    Self::enqueue(state, item);
                    return;
                }
                None => return,
            }
        }
    }

    pub fn receive(&self, out: &mut [u8]) -> Result<usize> {
        self.receive_with(out, Wait::Forever)
    }

    pub fn receive_timeout(&self, out: &mut [u8], ticks: Ticks) -> Result<usize> {
        self.receive_with(out, Wait::Timeout(ticks))
    }

    pub fn try_receive(&self, out: &mut [u8]) -> Result<usize> {
        self.receive_with(out, Wait::Poll)
    }

    pub fn receive_isr(&self, out: &mut [u8]) -> Result<usize> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        if state.used < LEN_PREFIX {
            return Err(ErrorKind::Again);
        }
        let n = Self::dequeue(&mut state, out)?;
        Self::drain_one_sender(&mut state);
        Ok(n)
    }

    pub fn free_space(&self) -> usize {
        Self::free_bytes(&self.inner.lock())
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
    fn send_then_receive_round_trip() {
        let ch = Channel::new(64, 16);
        ch.try_send(b"hello").unwrap();
        let mut out = [0u8; 16];
        let n = ch.try_receive(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[test]
    fn preserves_arrival_order() {
        let ch = Channel::new(64, 16);
        ch.try_send(b"first").unwrap();
        ch.try_send(b"second").unwrap();
        let mut out = [0u8; 16];
        let n1 = ch.try_receive(&mut out).unwrap();
        assert_eq!(&out[..n1], b"first");
        let n2 = ch.try_receive(&mut out).unwrap();
        assert_eq!(&out[..n2], b"second");
    }

    #[test]
    fn item_over_max_size_is_rejected() {
        let ch = Channel::new(64, 4);
        assert_eq!(ch.try_send(b"toolong"), Err(ErrorKind::Range));
    }

    #[test]
    fn destination_buffer_too_small_is_rejected() {
        let ch = Channel::new(64, 16);
        ch.try_send(b"hello").unwrap();
        let mut out = [0u8; 2];
        assert_eq!(ch.try_receive(&mut out), Err(ErrorKind::Range));
    }

    #[test]
    fn empty_channel_poll_receive_times_out() {
        let ch = Channel::new(64, 16);
        let mut out = [0u8; 16];
        assert_eq!(ch.try_receive(&mut out), Err(ErrorKind::TimedOut));
    }
}
