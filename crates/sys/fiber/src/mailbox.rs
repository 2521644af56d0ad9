//! No-allocation, no-copy message mailbox. Messages live in
//! caller-provided [`MailboxNode`] storage (typically embedded inside a
//! larger struct the sender owns); `send` only ever moves a pointer.
//! Because nothing is copied, the sender must keep the node's storage
//! alive until the matching `receive` has consumed it.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::kernel::{self, FiberId, ParkOutcome, Ticks, Wait};

/// Intrusive list node wrapping one message. Caller-owned; the mailbox
/// only ever touches the `next` link.
pub struct MailboxNode<T> {
    payload: T,
    next: UnsafeCell<*mut MailboxNode<T>>,
}

impl<T> MailboxNode<T> {
    pub fn new(payload: T) -> MailboxNode<T> {
        MailboxNode {
            payload,
            next: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    pub fn get(&self) -> &T {
        &self.payload
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

struct State<T> {
    head: *mut MailboxNode<T>,
    tail: *mut MailboxNode<T>,
    waiters: VecDeque<FiberId>,
    destroyed: bool,
}

// The mailbox itself only ever runs on one cooperative scheduler thread;
// the raw pointers it stores never cross an OS thread boundary.
unsafe impl<T> Send for State<T> {}

pub struct Mailbox<T> {
    inner: Mutex<State<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Mailbox<T> {
        Mailbox {
            inner: Mutex::new(State {
                head: core::ptr::null_mut(),
                tail: core::ptr::null_mut(),
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    fn try_pop(state: &mut State<T>) -> Option<*mut MailboxNode<T>> {
        if state.head.is_null() {
            return None;
        }
        let head = state.head;
        let next = unsafe { *(*head).next.get() };
        state.head = next;
        if next.is_null() {
            state.tail = core::ptr::null_mut();
        }
        Some(head)
    }

    /// Links `node` to the tail, or hands it straight to the
    /// longest-waiting receiver if one is already blocked.
    pub fn send(&self, node: &mut MailboxNode<T>) {
        let ptr: *mut MailboxNode<T> = node;
        let mut state = self.inner.lock();
        loop {
            match kernel::pop_best_waiter(&mut state.waiters) {
                Some(id) => {
                    kernel::set_wake_payload(id, ptr as usize);
                    if kernel::wake(id) {
                        return;
                    }
                    // `id` timed out between being queued and now; the
                    // payload hand-off never happened, so fall through
                    // to the next waiter instead of dropping the
                    // message.
                }
                None => break,
            }
        }
        unsafe { *node.next.get() = core::ptr::null_mut() };
        if state.tail.is_null() {
            state.head = ptr;
            state.tail = ptr;
        } else {
            unsafe { *(*state.tail).next.get() = ptr };
            state.tail = ptr;
        }
    }

    pub fn send_isr(&self, node: &mut MailboxNode<T>) {
        self.send(node)
    }

    fn receive_with(&self, timeout: Wait) -> Result<*mut MailboxNode<T>> {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ErrorKind::Canceled);
            }
            if let Some(ptr) = Self::try_pop(&mut state) {
                return Ok(ptr);
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
            if let Some(ptr) = Self::try_pop(&mut state) {
                return Ok(ptr);
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
            ParkOutcome::Woken => Ok(kernel::take_wake_payload(me) as *mut MailboxNode<T>),
        }
    }

    /// Returns the head message, or blocks forever until one arrives.
    /// # Safety
    /// The returned pointer is valid exactly as long as the sender keeps
    /// its `MailboxNode` storage alive; dereference it before that.
    pub unsafe fn receive(&self) -> Result<*mut MailboxNode<T>> {
        self.receive_with(Wait::Forever)
    }

    /// # Safety
    /// See [`Mailbox::receive`].
    pub unsafe fn receive_timeout(&self, ticks: Ticks) -> Result<*mut MailboxNode<T>> {
        self.receive_with(Wait::Timeout(ticks))
    }

    /// # Safety
    /// See [`Mailbox::receive`].
    pub unsafe fn try_receive(&self) -> Result<*mut MailboxNode<T>> {
        self.receive_with(Wait::Poll)
    }

    /// # Safety
    /// See [`Mailbox::receive`].
    pub unsafe fn receive_isr(&self) -> Result<*mut MailboxNode<T>> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(ErrorKind::Canceled);
        }
        Self::try_pop(&mut state).ok_or(ErrorKind::Again)
    }

    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        state.destroyed = true;
        while let Some(id) = state.waiters.pop_front() {
            kernel::cancel(id);
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Mailbox<T> {
        Mailbox::new()
    }
}
