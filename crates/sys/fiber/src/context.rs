//! Stack-switch context primitive.
//!
//! A fiber's saved context is just its stack pointer. The System V AMD64
//! ABI leaves every register except `rbx`, `rbp`, `r12`-`r15` and `rsp`
//! caller-saved, so a switch only has to preserve those six: push the
//! current set, stash `rsp`, load the next fiber's `rsp`, pop its set,
//! `ret` into wherever that fiber left off (or, on a fiber's first run,
//! into the bootstrap frame built by [`Stack::new`]).

use alloc::vec;
use alloc::vec::Vec;

/// A fiber's private stack plus the saved context needed to resume it.
pub struct Stack {
    // Kept alive for the lifetime of the fiber; never read from Rust once
    // `rsp` has been handed to `switch`.
    memory: Vec<u8>,
    rsp: usize,
}

impl Stack {
    /// Allocates a stack of `size` bytes and seeds it so that the first
    /// [`switch`] into it starts `entry` running.
    pub fn new(size: usize, entry: extern "C" fn() -> !) -> Stack {
        let mut memory = vec![0u8; size];
        let base = memory.as_mut_ptr() as usize;
        let top = (base + size) & !0xf;

        let mut sp = top;
        sp -= core::mem::size_of::<usize>();
        unsafe { (sp as *mut usize).write(entry as usize) };
        // Six dummy callee-saved slots consumed by switch's restore
        // sequence on the first resume; their contents are never read by
        // `entry` itself.
        for _ in 0..6 {
            sp -= core::mem::size_of::<usize>();
            unsafe { (sp as *mut usize).write(0) };
        }

        Stack { memory, rsp: sp }
    }

    pub fn rsp_ptr(&mut self) -> *mut usize {
        &mut self.rsp
    }
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch(prev_rsp: *mut usize, next_rsp: *const usize) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

#[cfg(not(target_arch = "x86_64"))]
compile_error!("vfskit-fiber's context switch is implemented for x86_64 only");
