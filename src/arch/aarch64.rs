// AArch64 AAPCS64: x19-x30, d8-d15 and nzcv
//
// frame (offsets from sp): x19..x28 0x00-0x48, x29/x30 0x50, d8..d15
// 0x60-0x98, nzcv 0xa0, pad to 0xb0

use core::arch::naked_asm;

use crate::kernel::fiber::FiberCb;
use crate::kernel::scheduler::fiber_entry;

pub(crate) const FRAME_SIZE: usize = 0xb0;

/// # Safety
/// Both stacks must be valid; `load` must come from `switch` or `prepare`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(_save: *mut usize, _load: usize) {
    naked_asm!(
        "sub sp, sp, #0xb0",
        "stp x19, x20, [sp, #0x00]",
        "stp x21, x22, [sp, #0x10]",
        "stp x23, x24, [sp, #0x20]",
        "stp x25, x26, [sp, #0x30]",
        "stp x27, x28, [sp, #0x40]",
        "stp x29, x30, [sp, #0x50]",
        "stp d8, d9, [sp, #0x60]",
        "stp d10, d11, [sp, #0x70]",
        "stp d12, d13, [sp, #0x80]",
        "stp d14, d15, [sp, #0x90]",
        "mrs x9, nzcv",
        "str x9, [sp, #0xa0]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldr x9, [sp, #0xa0]",
        "msr nzcv, x9",
        "ldp d14, d15, [sp, #0x90]",
        "ldp d12, d13, [sp, #0x80]",
        "ldp d10, d11, [sp, #0x70]",
        "ldp d8, d9, [sp, #0x60]",
        "ldp x29, x30, [sp, #0x50]",
        "ldp x27, x28, [sp, #0x40]",
        "ldp x25, x26, [sp, #0x30]",
        "ldp x23, x24, [sp, #0x20]",
        "ldp x21, x22, [sp, #0x10]",
        "ldp x19, x20, [sp, #0x00]",
        "add sp, sp, #0xb0",
        "ret",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn bootstrap() -> ! {
    naked_asm!(
        "mov x0, x19",
        "bl {entry}",
        "brk #0x1",
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
        frame.write(fiber as usize); // x19
        frame.add(0x58 / 8).write(start as usize); // x30
    }
    sp
}
