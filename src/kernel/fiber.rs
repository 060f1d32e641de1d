// Fiber control block, handle and stack carving
//
// A fiber lives entirely inside the block its creator hands over:
//
//   base                                                        top
//   | FiberCb | result buffer ->          ...         <- stack | frame |
//
// The control block sits at the (aligned) bottom, done() copies the
// result right behind it, and the execution stack grows down from the
// aligned top. The runtime never owns the block; the caller gets it back
// once the fiber is terminal and unlink()ed.

use core::cell::Cell;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use crate::arch;
use crate::kernel::error::CreateError;
use crate::kernel::list::Link;
use crate::kernel::scheduler::Scheduler;

/// Alignment of a fiber's initial stack pointer.
pub const STACK_ALIGN: usize = 16;

/// Smallest block `create` accepts: control block, first register frame
/// and worst-case alignment slack. The entry function's own frames are
/// on top of this and are the caller's to budget for.
pub const MIN_STACK_SIZE: usize =
    size_of::<FiberCb>() + arch::FRAME_SIZE + align_of::<FiberCb>() + STACK_ALIGN;

/// Fill pattern for untouched stack bytes.
pub const STACK_PAINT_BYTE: u8 = 0xA5;

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, queued on ready, never ran.
    Starting,
    /// Runnable (or running).
    Ready,
    /// Asleep on the scheduled queue or a join list.
    Scheduled,
    /// Finished through done() or by returning.
    Dead,
    /// Cancelled before finishing.
    Cancelled,
    /// No fiber (null handle).
    Unknown,
}

impl Status {
    /// One-byte tag: r R s d c, and ? for unknown.
    pub const fn code(self) -> u8 {
        match self {
            Status::Ready => b'r',
            Status::Starting => b'R',
            Status::Scheduled => b's',
            Status::Dead => b'd',
            Status::Cancelled => b'c',
            Status::Unknown => b'?',
        }
    }

    pub const fn is_alive(self) -> bool {
        matches!(self, Status::Starting | Status::Ready | Status::Scheduled)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Status::Dead | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Starting => "starting",
            Status::Ready => "ready",
            Status::Scheduled => "scheduled",
            Status::Dead => "dead",
            Status::Cancelled => "cancelled",
            Status::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[repr(C)]
pub(crate) struct FiberCb {
    // membership in ready / scheduled / dead / someone's waiters
    pub(crate) link: Link,
    // head of the fibers blocked in join() on this one
    pub(crate) waiters: Link,
    pub(crate) state: Cell<Status>,
    pub(crate) entry: Cell<Option<fn()>>,
    // saved stack pointer while switched out
    pub(crate) sp: Cell<usize>,
    pub(crate) sched: Cell<*const Scheduler>,
    // aligned stack top; 0 for the main fiber, which has no block
    pub(crate) top: Cell<usize>,
    pub(crate) result_len: Cell<usize>,
}

impl FiberCb {
    pub(crate) const fn new() -> Self {
        Self {
            link: Link::new(),
            waiters: Link::new(),
            state: Cell::new(Status::Ready),
            entry: Cell::new(None),
            sp: Cell::new(0),
            sched: Cell::new(ptr::null()),
            top: Cell::new(0),
            result_len: Cell::new(0),
        }
    }

    /// True for the fiber that runs on the ambient stack.
    #[inline]
    pub(crate) fn is_main(&self) -> bool {
        self.top.get() == 0
    }

    #[inline]
    fn result_ptr(&self) -> *mut u8 {
        (self as *const Self as *mut u8).wrapping_add(size_of::<Self>())
    }

    /// Copy `data` into the result buffer. The main fiber has none and
    /// keeps nothing.
    ///
    /// # Safety
    /// `data` must fit between the control block and the deepest live
    /// frame: when called on this fiber's own stack, below the current
    /// stack pointer.
    pub(crate) unsafe fn store_result(&self, data: &[u8]) {
        if self.is_main() {
            return;
        }
        debug_assert!(self.result_fits(data.len(), arch::stack_pointer()));
        // data may itself live on this fiber's stack
        unsafe { ptr::copy(data.as_ptr(), self.result_ptr(), data.len()) };
        self.result_len.set(data.len());
    }

    // A result of `len` bytes leaves the frames above `sp` alone. Only
    // an sp inside this block limits it; elsewhere the top does.
    fn result_fits(&self, len: usize, sp: usize) -> bool {
        let start = self.result_ptr() as usize;
        let top = self.top.get();
        let limit = if (start..top).contains(&sp) { sp } else { top };
        start + len <= limit
    }

    /// The bytes handed to done(), for a fiber that has a result.
    ///
    /// # Safety
    /// The block must not have been reused.
    pub(crate) unsafe fn result<'a>(&self) -> Option<&'a [u8]> {
        if self.is_main() || self.state.get() != Status::Dead {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(self.result_ptr(), self.result_len.get()) })
    }

    /// Bytes at the bottom of the stack, past any stored result, still
    /// holding the paint pattern.
    pub(crate) fn headroom(&self) -> Option<usize> {
        if self.is_main() || !cfg!(feature = "stack-paint") {
            return None;
        }
        let start = self.result_ptr().wrapping_add(self.result_len.get());
        // the initial register frame is never painted
        let len = (self.top.get() - arch::FRAME_SIZE).saturating_sub(start as usize);
        let mut n = 0;
        while n < len && unsafe { start.add(n).read_volatile() } == STACK_PAINT_BYTE {
            n += 1;
        }
        Some(n)
    }
}

/// Lay a control block out at the bottom of `[base, base + len)` and
/// arm its stack so the first switch into it lands in the bootstrap.
///
/// The control block is not linked into any queue yet.
///
/// # Safety
/// The block must be writable, unused by anything else, and outlive the
/// fiber's membership in the scheduler's queues.
pub(crate) unsafe fn carve(
    base: *mut u8,
    len: usize,
    entry: fn(),
    sched: *const Scheduler,
) -> Result<NonNull<FiberCb>, CreateError> {
    if base.is_null() || len < MIN_STACK_SIZE {
        return Err(CreateError::StackTooSmall {
            needed: MIN_STACK_SIZE,
            got: len,
        });
    }

    let start = base as usize;
    let cb_addr = align_up(start, align_of::<FiberCb>());
    let top = align_down(start + len, STACK_ALIGN);
    let cb = base.wrapping_add(cb_addr - start).cast::<FiberCb>();

    unsafe {
        cb.write(FiberCb::new());
        let fiber = &*cb;
        fiber.waiters.init();
        fiber.state.set(Status::Starting);
        fiber.entry.set(Some(entry));
        fiber.sched.set(sched);
        fiber.top.set(top);

        #[cfg(feature = "stack-paint")]
        {
            let paint = fiber.result_ptr();
            ptr::write_bytes(paint, STACK_PAINT_BYTE, top - arch::FRAME_SIZE - paint as usize);
        }

        fiber.sp.set(arch::prepare(top, cb));
        Ok(NonNull::new_unchecked(cb))
    }
}

#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[inline]
const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Handle to a fiber: a typed pointer into caller-owned memory.
///
/// Handles stay meaningful until the block behind them is reused, which
/// the owner may only do after the fiber is terminal and unlink()ed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fiber(NonNull<FiberCb>);

// handles are only dereferenced inside atomic sections
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    #[inline]
    pub(crate) fn from_cb(cb: &FiberCb) -> Self {
        Fiber(NonNull::from(cb))
    }

    // valid for as long as the owner keeps the block alive
    #[inline]
    pub(crate) fn cb<'a>(self) -> &'a FiberCb {
        unsafe { self.0.as_ref() }
    }

    /// Address of the control block, for logging and comparisons.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({:#x})", self.addr())
    }
}

/// Statically allocatable fiber stack.
///
/// ```ignore
/// static STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
/// SCHED.create(worker, STACK.take().as_mut_slice());
/// ```
#[repr(C, align(16))]
pub struct Stack<const N: usize>([u8; N]);

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Self([0u8; N])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> Default for Stack<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for Stack<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> DerefMut for Stack<N> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() {}

    #[test]
    fn status_codes_match_tags() {
        let codes: Vec<u8> = [
            Status::Ready,
            Status::Starting,
            Status::Scheduled,
            Status::Dead,
            Status::Cancelled,
            Status::Unknown,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        assert_eq!(codes, b"rRsdc?");
        assert_eq!(Status::Scheduled.to_string(), "scheduled");
        assert!(Status::Starting.is_alive());
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Unknown.is_alive());
    }

    #[test]
    fn carve_rejects_small_blocks() {
        let mut block = [0u8; 8];
        let err = unsafe { carve(block.as_mut_ptr(), block.len(), noop, ptr::null()) };
        assert_eq!(
            err.err(),
            Some(CreateError::StackTooSmall {
                needed: MIN_STACK_SIZE,
                got: 8
            })
        );
    }

    #[test]
    fn carve_places_block_at_bottom_and_stack_at_top() {
        let mut block = Stack::<1024>::new();
        let base = block.as_mut_ptr();
        let cb = unsafe { carve(base, 1024, noop, ptr::null()) }.unwrap();
        let fiber = unsafe { cb.as_ref() };

        assert_eq!(cb.as_ptr() as usize, base as usize);
        assert_eq!(fiber.state.get(), Status::Starting);
        assert!(fiber.waiters.is_empty());
        assert!(!fiber.link.is_linked());
        assert!(!fiber.is_main());
        assert_eq!(fiber.top.get(), base as usize + 1024);
        assert_eq!(fiber.sp.get(), fiber.top.get() - arch::FRAME_SIZE);
        assert_eq!(fiber.sp.get() % STACK_ALIGN, 0);
    }

    #[test]
    fn unaligned_block_is_aligned_inside() {
        let mut block = Stack::<1024>::new();
        let base = unsafe { block.as_mut_ptr().add(3) };
        let cb = unsafe { carve(base, 1000, noop, ptr::null()) }.unwrap();
        assert_eq!(cb.as_ptr() as usize % align_of::<FiberCb>(), 0);
        assert!(cb.as_ptr() as usize >= base as usize);
        let top = unsafe { cb.as_ref() }.top.get();
        assert_eq!(top % STACK_ALIGN, 0);
        assert!(top <= base as usize + 1000);
    }

    #[cfg(feature = "stack-paint")]
    #[test]
    fn fresh_stack_is_fully_painted() {
        let mut block = Stack::<2048>::new();
        let cb = unsafe { carve(block.as_mut_ptr(), 2048, noop, ptr::null()) }.unwrap();
        let fiber = unsafe { cb.as_ref() };
        let expected = fiber.top.get() - arch::FRAME_SIZE - fiber.result_ptr() as usize;
        assert_eq!(fiber.headroom(), Some(expected));
    }

    #[test]
    fn result_buffer_holds_copy_once_dead() {
        let mut block = Stack::<1024>::new();
        let cb = unsafe { carve(block.as_mut_ptr(), 1024, noop, ptr::null()) }.unwrap();
        let fiber = unsafe { cb.as_ref() };
        unsafe { fiber.store_result(b"hello") };
        assert_eq!(unsafe { fiber.result() }, None);
        fiber.state.set(Status::Dead);
        assert_eq!(unsafe { fiber.result() }, Some(&b"hello"[..]));
    }

    #[test]
    fn result_must_stay_below_the_running_frame() {
        let mut block = Stack::<1024>::new();
        let cb = unsafe { carve(block.as_mut_ptr(), 1024, noop, ptr::null()) }.unwrap();
        let fiber = unsafe { cb.as_ref() };
        let start = fiber.result_ptr() as usize;
        let top = fiber.top.get();

        // running on this block: the live frame starts at sp
        let sp = start + 64;
        assert!(fiber.result_fits(64, sp));
        assert!(!fiber.result_fits(65, sp));
        assert!(!fiber.result_fits(128, sp));

        // running elsewhere (the joiner, a test thread): only the top counts
        assert!(fiber.result_fits(top - start, top + 4096));
        assert!(!fiber.result_fits(top - start + 1, top + 4096));
    }

    #[test]
    fn main_block_keeps_no_result() {
        let main = FiberCb::new();
        assert!(main.is_main());
        unsafe { main.store_result(b"ignored") };
        main.state.set(Status::Dead);
        assert_eq!(main.result_len.get(), 0);
        assert_eq!(unsafe { main.result() }, None);
        assert_eq!(main.headroom(), None);
    }
}
