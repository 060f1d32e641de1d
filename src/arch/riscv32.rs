// RV32 ilp32 (ESP32-C3): ra, s0-s11
//
// frame (offsets from sp): ra 0, s0..s11 4-48, pad to 64. mstatus is
// left alone; MIE belongs to the atomic section.

use core::arch::naked_asm;

use crate::kernel::fiber::FiberCb;
use crate::kernel::scheduler::fiber_entry;

pub(crate) const FRAME_SIZE: usize = 64;

/// # Safety
/// Both stacks must be valid; `load` must come from `switch` or `prepare`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(_save: *mut usize, _load: usize) {
    naked_asm!(
        "addi sp, sp, -64",
        "sw ra, 0(sp)",
        "sw s0, 4(sp)",
        "sw s1, 8(sp)",
        "sw s2, 12(sp)",
        "sw s3, 16(sp)",
        "sw s4, 20(sp)",
        "sw s5, 24(sp)",
        "sw s6, 28(sp)",
        "sw s7, 32(sp)",
        "sw s8, 36(sp)",
        "sw s9, 40(sp)",
        "sw s10, 44(sp)",
        "sw s11, 48(sp)",
        "sw sp, 0(a0)",
        "mv sp, a1",
        "lw ra, 0(sp)",
        "lw s0, 4(sp)",
        "lw s1, 8(sp)",
        "lw s2, 12(sp)",
        "lw s3, 16(sp)",
        "lw s4, 20(sp)",
        "lw s5, 24(sp)",
        "lw s6, 28(sp)",
        "lw s7, 32(sp)",
        "lw s8, 36(sp)",
        "lw s9, 40(sp)",
        "lw s10, 44(sp)",
        "lw s11, 48(sp)",
        "addi sp, sp, 64",
        "ret",
    );
}

#[unsafe(naked)]
unsafe extern "C" fn bootstrap() -> ! {
    naked_asm!(
        "mv a0, s1",
        "call {entry}",
        "unimp",
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
        frame.write(start as usize); // ra
        frame.add(2).write(fiber as usize); // s1
    }
    sp
}
