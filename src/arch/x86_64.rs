// x86_64 System V: rbp rbx r12-r15 and rflags
//
// frame, low to high: rflags r15 r14 r13 r12 rbx rbp ret

use core::arch::naked_asm;

use crate::kernel::fiber::FiberCb;
use crate::kernel::scheduler::fiber_entry;

pub(crate) const FRAME_SIZE: usize = 8 * 8;

// IF plus the always-set reserved bit; IF is ignored outside ring 0
const INITIAL_RFLAGS: usize = 0x202;

/// # Safety
/// Both stacks must be valid; `load` must come from `switch` or `prepare`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(_save: *mut usize, _load: usize) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

// entered by `ret` with rsp 16-aligned; the call realigns for fiber_entry
#[unsafe(naked)]
unsafe extern "C" fn bootstrap() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "call {entry}",
        "ud2",
        entry = sym fiber_entry,
    );
}

/// # Safety
/// `top` must be 16-aligned with FRAME_SIZE writable bytes below it.
pub(crate) unsafe fn prepare(top: usize, fiber: *const FiberCb) -> usize {
    let sp = top - FRAME_SIZE;
    let frame = sp as *mut usize;
    let start: unsafe extern "C" fn() -> ! = bootstrap;
    unsafe {
        core::ptr::write_bytes(frame, 0, FRAME_SIZE / size_of::<usize>());
        frame.write(INITIAL_RFLAGS);
        frame.add(4).write(fiber as usize); // r12
        frame.add(7).write(start as usize); // ret
    }
    sp
}
