//! The fiber scheduler: fiber table, priority ready queues, delay queue,
//! and the suspension points (yield, delay, blocking wait, suspend) every
//! other module in this crate is built from.
//!
//! There is exactly one kernel, reached through free functions rather
//! than a handle threaded through every call, the same shape as the
//! originating C library's single global scheduler. Its state lives
//! behind one lock; every operation that mutates it drops the lock
//! before performing an actual context switch so the next fiber never
//! tries to re-enter an already-held lock.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;
use vfskit_error::{ErrorKind, Result};

use crate::context::{self, Stack};

pub type Ticks = u64;
pub const TICKS_FOREVER: Ticks = u64::MAX;
pub const PRIORITY_COUNT: usize = 8;
pub type FiberId = usize;
pub type IdleHook = fn() -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Ready,
    Running,
    Delayed,
    Blocked,
    Suspended,
    Terminated,
}

/// The three wait forms common to every blocking primitive.
#[derive(Clone, Copy)]
pub(crate) enum Wait {
    Forever,
    Timeout(Ticks),
    Poll,
}

pub(crate) enum ParkOutcome {
    Woken,
    TimedOut,
    Canceled,
}

#[derive(Clone, Copy)]
pub(crate) struct SignalWait {
    pub pattern: u32,
    pub and_mode: bool,
    pub clear_on_exit: bool,
}

struct FiberSlot {
    name: &'static str,
    priority: u8,
    state: FiberState,
    stack: Stack,
    wake_tick: u64,
    has_deadline: bool,
    timed_out: bool,
    canceled: bool,
    entry: Option<Box<dyn FnOnce()>>,
    signal_bits: u32,
    signal_wait: Option<SignalWait>,
    /// Scratch slot a waker writes into before marking a blocked fiber
    /// ready, read back once the fiber resumes. Used by primitives whose
    /// successful wait returns a value (event/signal bit snapshots).
    result_bits: u32,
    /// Generic handoff slot: whoever wakes a waiter with a reserved
    /// resource (a pool block's offset, a mailbox node's address) stashes
    /// it here so the resource is never visible to a third fiber that
    /// runs between the wake and the waiter's actual resumption.
    wake_payload: usize,
}

struct KernelState {
    fibers: Vec<Option<Box<FiberSlot>>>,
    ready: [VecDeque<FiberId>; PRIORITY_COUNT],
    current: Option<FiberId>,
    tick: u64,
    idle_hook: Option<IdleHook>,
    running: bool,
    should_stop: bool,
    main_ctx: usize,
}

impl KernelState {
    fn new(idle_hook: Option<IdleHook>) -> KernelState {
        KernelState {
            fibers: Vec::new(),
            ready: Default::default(),
            current: None,
            tick: 0,
            idle_hook,
            running: false,
            should_stop: false,
            main_ctx: 0,
        }
    }

    fn fiber(&self, id: FiberId) -> &FiberSlot {
        self.fibers[id].as_ref().expect("dead fiber id")
    }

    fn fiber_mut(&mut self, id: FiberId) -> &mut FiberSlot {
        self.fibers[id].as_mut().expect("dead fiber id")
    }

    fn fiber_mut_opt(&mut self, id: FiberId) -> Option<&mut FiberSlot> {
        self.fibers.get_mut(id).and_then(|s| s.as_mut())
    }

    fn fiber_mut_checked(&mut self, id: FiberId) -> Result<&mut FiberSlot> {
        self.fiber_mut_opt(id).ok_or(ErrorKind::Invalid)
    }
}

static KERNEL: Mutex<Option<KernelState>> = Mutex::new(None);

extern "C" fn trampoline() -> ! {
    let id = current().expect("trampoline running without a current fiber");
    let entry = {
        let mut guard = KERNEL.lock();
        guard.as_mut().unwrap().fiber_mut(id).entry.take()
    };
    if let Some(f) = entry {
        f();
    }
    {
        let mut guard = KERNEL.lock();
        guard.as_mut().unwrap().fiber_mut(id).state = FiberState::Terminated;
    }
    switch_to_scheduler(id);
    loop {}
}

/// (Re)initializes the kernel. Any fibers created under a previous
/// initialization are discarded. Must be called before [`create`] or
/// [`start_scheduler`].
pub fn init(idle_hook: Option<IdleHook>) {
    *KERNEL.lock() = Some(KernelState::new(idle_hook));
}

/// True once [`init`] has run and before the kernel is reinitialized.
pub fn is_initialized() -> bool {
    KERNEL.lock().is_some()
}

pub fn create(
    priority: u8,
    name: &'static str,
    stack_size: usize,
    entry: impl FnOnce() + 'static,
) -> Result<FiberId> {
    if priority as usize >= PRIORITY_COUNT {
        return Err(ErrorKind::Range);
    }
    let mut guard = KERNEL.lock();
    let k = guard.as_mut().ok_or(ErrorKind::Protocol)?;
    let slot = Box::new(FiberSlot {
        name,
        priority,
        state: FiberState::Ready,
        stack: Stack::new(stack_size, trampoline),
        wake_tick: 0,
        has_deadline: false,
        timed_out: false,
        canceled: false,
        entry: Some(Box::new(entry)),
        signal_bits: 0,
        signal_wait: None,
        result_bits: 0,
        wake_payload: 0,
    });
    let id = k.fibers.len();
    k.fibers.push(Some(slot));
    k.ready[priority as usize].push_back(id);
    Ok(id)
}

pub fn current() -> Option<FiberId> {
    KERNEL.lock().as_ref().and_then(|k| k.current)
}

pub fn name(id: FiberId) -> Option<&'static str> {
    KERNEL
        .lock()
        .as_ref()
        .and_then(|k| k.fibers.get(id))
        .and_then(|s| s.as_ref())
        .map(|s| s.name)
}

pub fn state(id: FiberId) -> Option<FiberState> {
    KERNEL
        .lock()
        .as_ref()
        .and_then(|k| k.fibers.get(id))
        .and_then(|s| s.as_ref())
        .map(|s| s.state)
}

fn switch_to_scheduler(me: FiberId) {
    let (fiber_rsp_ptr, main_ctx_ptr) = {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().unwrap();
        let main_ctx_ptr = &mut k.main_ctx as *mut usize;
        let fiber_rsp_ptr = k.fiber_mut(me).stack.rsp_ptr();
        (fiber_rsp_ptr, main_ctx_ptr)
    };
    unsafe { context::switch(fiber_rsp_ptr, main_ctx_ptr) };
}

/// Moves the caller to the tail of its priority's ready queue and hands
/// control back to the scheduler.
pub fn yield_now() {
    let me = match current() {
        Some(id) => id,
        None => return,
    };
    {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().unwrap();
        let pr = k.fiber(me).priority;
        k.fiber_mut(me).state = FiberState::Ready;
        k.ready[pr as usize].push_back(me);
    }
    switch_to_scheduler(me);
}

/// Parks the caller on the delay queue; it becomes ready no earlier than
/// `ticks` ticks from now.
pub fn delay(ticks: Ticks) {
    let me = match current() {
        Some(id) => id,
        None => return,
    };
    {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().unwrap();
        let tick = k.tick;
        let slot = k.fiber_mut(me);
        slot.state = FiberState::Delayed;
        slot.has_deadline = true;
        slot.wake_tick = tick.wrapping_add(ticks);
    }
    switch_to_scheduler(me);
}

/// Explicitly suspends `id`. Suspending the caller itself hands control
/// back to the scheduler; suspending another fiber just marks it.
pub fn suspend(id: FiberId) -> Result<()> {
    let is_self = current() == Some(id);
    {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().ok_or(ErrorKind::Protocol)?;
        let slot = k.fiber_mut_checked(id)?;
        slot.state = FiberState::Suspended;
        slot.has_deadline = false;
    }
    if is_self {
        switch_to_scheduler(id);
    }
    Ok(())
}

/// Moves a previously suspended fiber back to ready.
pub fn resume(id: FiberId) -> Result<()> {
    let mut guard = KERNEL.lock();
    let k = guard.as_mut().ok_or(ErrorKind::Protocol)?;
    let slot = k.fiber_mut_checked(id)?;
    if slot.state != FiberState::Suspended {
        return Err(ErrorKind::Protocol);
    }
    slot.state = FiberState::Ready;
    let pr = slot.priority;
    k.ready[pr as usize].push_back(id);
    Ok(())
}

fn drain_delayed(k: &mut KernelState) {
    let tick = k.tick;
    for id in 0..k.fibers.len() {
        let wake = {
            let slot = match k.fibers[id].as_mut() {
                Some(s) => s,
                None => continue,
            };
            if !slot.has_deadline {
                continue;
            }
            match slot.state {
                FiberState::Delayed | FiberState::Blocked => {}
                _ => continue,
            }
            if tick < slot.wake_tick {
                continue;
            }
            slot.has_deadline = false;
            if slot.state == FiberState::Blocked {
                slot.timed_out = true;
            }
            slot.state = FiberState::Ready;
            slot.priority
        };
        k.ready[wake as usize].push_back(id);
    }
}

fn pick_ready(k: &mut KernelState) -> Option<FiberId> {
    for q in k.ready.iter_mut() {
        if let Some(id) = q.pop_front() {
            return Some(id);
        }
    }
    None
}

/// Runs the scheduler loop until [`end_scheduler`] is called or the idle
/// hook reports it should stop. Returns once the loop exits, back at the
/// call site, the way `xfiber_kernel_start_scheduler` does.
pub fn start_scheduler() -> Result<()> {
    {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().ok_or(ErrorKind::Protocol)?;
        if k.running {
            return Err(ErrorKind::InProgress);
        }
        k.running = true;
        k.should_stop = false;
    }

    loop {
        {
            let mut guard = KERNEL.lock();
            let k = guard.as_mut().unwrap();
            if k.should_stop {
                k.running = false;
                break;
            }
            k.tick = k.tick.wrapping_add(1);
            drain_delayed(k);
        }

        let next = {
            let mut guard = KERNEL.lock();
            let k = guard.as_mut().unwrap();
            pick_ready(k)
        };

        let id = match next {
            Some(id) => id,
            None => {
                let hook = KERNEL.lock().as_ref().unwrap().idle_hook;
                match hook {
                    Some(hook) => {
                        if hook() != 0 {
                            let mut guard = KERNEL.lock();
                            guard.as_mut().unwrap().running = false;
                            break;
                        }
                        continue;
                    }
                    None => continue,
                }
            }
        };

        let (main_ctx_ptr, fiber_rsp_ptr) = {
            let mut guard = KERNEL.lock();
            let k = guard.as_mut().unwrap();
            k.fiber_mut(id).state = FiberState::Running;
            k.current = Some(id);
            let main_ctx_ptr = &mut k.main_ctx as *mut usize;
            let fiber_rsp_ptr = k.fiber_mut(id).stack.rsp_ptr();
            (main_ctx_ptr, fiber_rsp_ptr)
        };
        unsafe { context::switch(main_ctx_ptr, fiber_rsp_ptr) };

        let mut guard = KERNEL.lock();
        guard.as_mut().unwrap().current = None;
    }
    Ok(())
}

/// Requests the scheduler loop exit on its next iteration. If called from
/// a fiber, that fiber is frozen in the suspended state: fibers are never
/// destroyed by ending the scheduler.
pub fn end_scheduler() {
    let me = current();
    {
        let mut guard = KERNEL.lock();
        if let Some(k) = guard.as_mut() {
            k.should_stop = true;
            if let Some(id) = me {
                k.fiber_mut(id).state = FiberState::Suspended;
            }
        }
    }
    if let Some(id) = me {
        switch_to_scheduler(id);
    }
}

// --- building blocks used by the synchronisation primitives ---

pub(crate) fn current_id() -> Option<FiberId> {
    current()
}

pub(crate) fn current_priority() -> u8 {
    match current() {
        Some(id) => KERNEL.lock().as_ref().unwrap().fiber(id).priority,
        None => (PRIORITY_COUNT - 1) as u8,
    }
}

/// Blocks the calling fiber until woken by [`wake`], [`cancel`], or a
/// timeout. Must only be called from fiber context.
pub(crate) fn park(timeout: Wait) -> ParkOutcome {
    let me = match current() {
        Some(id) => id,
        None => return ParkOutcome::Canceled,
    };
    {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().unwrap();
        let tick = k.tick;
        let slot = k.fiber_mut(me);
        slot.timed_out = false;
        slot.canceled = false;
        slot.state = FiberState::Blocked;
        match timeout {
            Wait::Timeout(t) => {
                slot.has_deadline = true;
                slot.wake_tick = tick.wrapping_add(t);
            }
            _ => slot.has_deadline = false,
        }
    }
    switch_to_scheduler(me);
    let mut guard = KERNEL.lock();
    let k = guard.as_mut().unwrap();
    let slot = k.fiber_mut(me);
    if slot.canceled {
        ParkOutcome::Canceled
    } else if slot.timed_out {
        ParkOutcome::TimedOut
    } else {
        ParkOutcome::Woken
    }
}

/// Marks a blocked fiber ready without switching to it; the scheduler
/// picks it up on its next pass, matching `*_isr` semantics.
///
/// Returns `true` if `id` was actually transitioned out of `Blocked`.
/// A primitive's own `waiters` deque and a fiber's kernel-tracked state
/// live behind different locks, so a waiter's deadline can elapse (via
/// [`drain_delayed`], which flips it `Blocked -> Ready` but has no way
/// to reach into the primitive to remove it from that deque) in the gap
/// between a waker popping it out of the deque and calling `wake`. This
/// return value lets every caller detect that race: a `false` result
/// means the hand-off did not happen and whatever resource or message
/// was being passed to `id` must be given to the next waiter, or kept,
/// instead of being dropped on the floor.
pub(crate) fn wake(id: FiberId) -> bool {
    let mut guard = KERNEL.lock();
    if let Some(k) = guard.as_mut() {
        if let Some(slot) = k.fiber_mut_opt(id) {
            if slot.state == FiberState::Blocked {
                slot.has_deadline = false;
                slot.state = FiberState::Ready;
                let pr = slot.priority;
                k.ready[pr as usize].push_back(id);
                return true;
            }
        }
    }
    false
}

/// Wakes a blocked fiber with a *canceled* outcome; used when a
/// primitive is destroyed while fibers wait on it.
pub(crate) fn cancel(id: FiberId) {
    let mut guard = KERNEL.lock();
    if let Some(k) = guard.as_mut() {
        if let Some(slot) = k.fiber_mut_opt(id) {
            if slot.state == FiberState::Blocked {
                slot.canceled = true;
                slot.has_deadline = false;
                slot.state = FiberState::Ready;
                let pr = slot.priority;
                k.ready[pr as usize].push_back(id);
            }
        }
    }
}

pub(crate) fn take_result_bits(id: FiberId) -> u32 {
    let mut guard = KERNEL.lock();
    guard.as_mut().unwrap().fiber_mut(id).result_bits
}

pub(crate) fn take_wake_payload(id: FiberId) -> usize {
    let mut guard = KERNEL.lock();
    guard.as_mut().unwrap().fiber_mut(id).wake_payload
}

pub(crate) fn set_wake_payload(id: FiberId, v: usize) {
    let mut guard = KERNEL.lock();
    if let Some(k) = guard.as_mut() {
        if let Some(slot) = k.fiber_mut_opt(id) {
            slot.wake_payload = v;
        }
    }
}

pub(crate) fn set_result_bits(id: FiberId, v: u32) {
    let mut guard = KERNEL.lock();
    if let Some(k) = guard.as_mut() {
        if let Some(slot) = k.fiber_mut_opt(id) {
            slot.result_bits = v;
        }
    }
}

/// Removes and returns the highest-priority waiter, earliest-inserted
/// among ties, implementing the FIFO-within-priority wake order every
/// primitive shares.
pub(crate) fn pop_best_waiter(waiters: &mut VecDeque<FiberId>) -> Option<FiberId> {
    if waiters.is_empty() {
        return None;
    }
    let guard = KERNEL.lock();
    let k = guard.as_ref().unwrap();
    let mut best_idx = 0usize;
    let mut best_priority = u8::MAX;
    for (i, &id) in waiters.iter().enumerate() {
        if let Some(Some(slot)) = k.fibers.get(id) {
            if slot.priority < best_priority {
                best_priority = slot.priority;
                best_idx = i;
            }
        }
    }
    drop(guard);
    waiters.remove(best_idx)
}

pub(crate) fn signal_wait(and_mode: bool, pattern: u32, clear_on_exit: bool, timeout: Wait) -> Result<u32> {
    let me = current().ok_or(ErrorKind::Protocol)?;
    {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().unwrap();
        let slot = k.fiber_mut(me);
        let satisfied = if and_mode {
            slot.signal_bits & pattern == pattern
        } else {
            slot.signal_bits & pattern != 0
        };
        if satisfied {
            let snapshot = slot.signal_bits;
            if clear_on_exit {
                slot.signal_bits &= !pattern;
            }
            return Ok(snapshot);
        }
        if matches!(timeout, Wait::Poll) {
            return Err(ErrorKind::TimedOut);
        }
        slot.signal_wait = Some(SignalWait { pattern, and_mode, clear_on_exit });
    }
    match park(timeout) {
        ParkOutcome::Canceled => Err(ErrorKind::Canceled),
        ParkOutcome::TimedOut => {
            let mut guard = KERNEL.lock();
            guard.as_mut().unwrap().fiber_mut(me).signal_wait = None;
            Err(ErrorKind::TimedOut)
        }
        ParkOutcome::Woken => Ok(take_result_bits(me)),
    }
}

pub fn signal_raise(target: FiberId, bits: u32) -> Result<()> {
    let mut guard = KERNEL.lock();
    let k = guard.as_mut().ok_or(ErrorKind::Protocol)?;
    let slot = k.fiber_mut_checked(target)?;
    slot.signal_bits |= bits;
    if let Some(w) = slot.signal_wait {
        let satisfied = if w.and_mode {
            slot.signal_bits & w.pattern == w.pattern
        } else {
            slot.signal_bits & w.pattern != 0
        };
        if satisfied && slot.state == FiberState::Blocked {
            let snapshot = slot.signal_bits;
            if w.clear_on_exit {
                slot.signal_bits &= !w.pattern;
            }
            slot.signal_wait = None;
            slot.result_bits = snapshot;
            slot.has_deadline = false;
            slot.state = FiberState::Ready;
            let pr = slot.priority;
            k.ready[pr as usize].push_back(target);
        }
    }
    Ok(())
}

/// Non-blocking, interrupt-context counterpart of [`signal_raise`]: the
/// kernel never switches inside a raise, so the two are identical here.
pub fn signal_raise_isr(target: FiberId, bits: u32) -> Result<()> {
    signal_raise(target, bits)
}
