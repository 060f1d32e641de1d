// Atomic sections: scoped interrupt masking over critical-section
//
// Scheduler-path code and ISR-path wakeup() both splice the same queues,
// so every splice happens inside one of these. The platform impl
// (esp-hal on target, critical-section/std on a host) does the masking;
// release restores whatever state acquire saw, so nesting is fine.
//
// Sections normally end on drop. A context switch is the exception: the
// outgoing fiber leaves its section open and the incoming fiber closes
// it, so the token travels through the scheduler (see hand_off/resume).

use critical_section::RestoreState;

use crate::arch;

pub struct Section {
    restore: RestoreState,
    open: bool,
}

impl Section {
    /// Mask interrupts until the section is dropped.
    #[inline]
    pub fn begin() -> Self {
        let restore = unsafe { critical_section::acquire() };
        Self {
            restore,
            open: true,
        }
    }

    /// Leave the section open and hand its restore state to whoever
    /// runs next.
    #[inline]
    pub fn hand_off(mut self) -> RestoreState {
        self.open = false;
        self.restore
    }

    /// Adopt a section some other fiber opened and handed off.
    ///
    /// # Safety
    /// `restore` must come from [`Section::hand_off`] and be adopted once.
    #[inline]
    pub unsafe fn resume(restore: RestoreState) -> Self {
        Self {
            restore,
            open: true,
        }
    }

    /// Sleep until an interrupt is pending, then unmask long enough for
    /// its handler to run and mask again. The caller re-checks whatever
    /// the handler may have changed.
    #[inline]
    pub fn wait_for_interrupt(&mut self) {
        arch::wait_for_interrupt();
        unsafe { critical_section::release(self.restore) };
        arch::interrupt_window();
        self.restore = unsafe { critical_section::acquire() };
    }
}

impl Drop for Section {
    #[inline]
    fn drop(&mut self) {
        if self.open {
            unsafe { critical_section::release(self.restore) };
        }
    }
}
