// Processor context switch and idle, per target
//
// switch(save, load) pushes the callee-saved registers (plus the flags
// register where userland can see one) on the running stack, stores the
// stack pointer into *save, loads `load`, pops and returns into whatever
// that stack was doing. prepare() fakes such a frame on a fresh stack so
// the first switch into it "returns" into a bootstrap stub that calls
// kernel::scheduler::fiber_entry with the fiber's control block.
//
// Interrupt enable state is not part of the frame: it travels with the
// atomic section handed across the switch.

#[cfg(target_arch = "riscv32")]
#[path = "riscv32.rs"]
mod imp;

#[cfg(all(target_arch = "x86_64", not(windows)))]
#[path = "x86_64.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod imp;

#[cfg(not(any(
    target_arch = "riscv32",
    all(target_arch = "x86_64", not(windows)),
    target_arch = "aarch64"
)))]
compile_error!("pulp-fiber has no context switch for this target");

pub(crate) use imp::{FRAME_SIZE, prepare, switch};

/// Idle until an interrupt is pending. Call with interrupts masked: wfi
/// still wakes on a pending source, and the handler runs once the caller
/// unmasks, so nothing it does can slip in ahead of the sleep.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv32")]
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }

    #[cfg(not(target_arch = "riscv32"))]
    {
        core::hint::spin_loop();
    }
}

/// Give pending interrupts a chance to run. Call with interrupts
/// unmasked. On target they are taken the moment the mask drops; host
/// "interrupts" are other threads and need the CPU handed over.
#[inline]
pub fn interrupt_window() {
    #[cfg(all(not(target_arch = "riscv32"), any(test, feature = "std")))]
    {
        std::thread::yield_now();
    }
}

/// Current stack pointer.
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    #[cfg(target_arch = "riscv32")]
    unsafe {
        core::arch::asm!("mv {}, sp", out(reg) sp, options(nomem, nostack));
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack));
    }
    sp
}
