// Cooperative fiber scheduler
//
// One core, no preemption, strict FIFO. Fibers give up the CPU only in
// cede() and schedule() (and what is built on it: join, done, cancelling
// yourself). ISRs may call wakeup() at any moment, so every queue splice
// happens inside an atomic section.
//
// The running fiber, while ready, sits at the head of the ready queue;
// "next" is always the entry right behind it. A switch parks the running
// fiber on its target queue, makes next current and swaps stacks. The
// section opened by the outgoing fiber is closed by the incoming one:
// either right after its own switch() returns, or in the bootstrap when
// it runs for the first time.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use critical_section::{CriticalSection, Mutex, RestoreState};
use log::{debug, trace, warn};

use crate::arch;
use crate::entry_of;
use crate::kernel::atomic::Section;
use crate::kernel::error::{CreateError, JoinError};
use crate::kernel::fiber::{self, Fiber, FiberCb, Status};
use crate::kernel::list::Link;

/// Scheduler queues, for inspection with [`Scheduler::for_each`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Runnable fibers; the running one is at the head.
    Ready,
    /// Fibers asleep in schedule().
    Scheduled,
    /// Finished and cancelled fibers not yet unlink()ed.
    Dead,
    /// Fibers blocked in join() on the given fiber.
    Waiters(Fiber),
}

struct Queues {
    initialized: Cell<bool>,
    current: Cell<*const FiberCb>,
    ready: Link,
    scheduled: Link,
    dead: Link,
    main: FiberCb,
    // restore state of the section left open across an in-flight switch
    handoff: Cell<RestoreState>,
}

// only touched inside atomic sections
unsafe impl Send for Queues {}

impl Queues {
    fn current(&self) -> Option<&FiberCb> {
        unsafe { self.current.get().as_ref() }
    }

    fn next_ready(&self) -> Option<&FiberCb> {
        self.ready.nth(1).map(|link| unsafe { cb_of(link) })
    }

    fn head(&self, queue: Queue) -> &Link {
        match queue {
            Queue::Ready => &self.ready,
            Queue::Scheduled => &self.scheduled,
            Queue::Dead => &self.dead,
            Queue::Waiters(fiber) => &fiber.cb().waiters,
        }
    }

    fn is_current(&self, fiber: &FiberCb) -> bool {
        ptr::eq(fiber, self.current.get())
    }

    // sleeping fiber back to the tail of ready
    fn make_ready(&self, fiber: &FiberCb) {
        if !self.is_current(fiber) {
            unsafe {
                fiber.link.remove();
                fiber.link.add_back(&self.ready);
            }
        }
        fiber.state.set(Status::Ready);
    }

    fn wake_waiters(&self, fiber: &FiberCb) {
        while let Some(link) = fiber.waiters.first() {
            self.make_ready(unsafe { cb_of(link) });
        }
    }
}

unsafe fn cb_of<'a>(link: NonNull<Link>) -> &'a FiberCb {
    unsafe { &*entry_of!(link.as_ptr(), FiberCb, link) }
}

/// The fiber runtime for one core.
///
/// Lives in a `static`; `init()` anchors the queues in place, after which
/// the scheduler must never move.
///
/// ```ignore
/// static SCHED: Scheduler = Scheduler::new();
///
/// fn worker() {
///     SCHED.cede();
///     SCHED.done(b"ok");
/// }
///
/// SCHED.init();
/// let w = SCHED.create(worker, STACK.take().as_mut_slice()).unwrap();
/// assert_eq!(SCHED.join(w), Some(&b"ok"[..]));
/// ```
pub struct Scheduler {
    queues: Mutex<Queues>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                initialized: Cell::new(false),
                current: Cell::new(ptr::null()),
                ready: Link::new(),
                scheduled: Link::new(),
                dead: Link::new(),
                main: FiberCb::new(),
                handoff: Cell::new(RestoreState::invalid()),
            }),
        }
    }

    // Caller must be inside an atomic section. The borrow is not tied to
    // the section because the switch path hands its section off.
    unsafe fn queues(&self) -> &Queues {
        self.queues.borrow(unsafe { CriticalSection::new() })
    }

    /// Register the calling context as the main fiber. Only the first call
    /// does anything.
    pub fn init(&'static self) {
        let fresh = critical_section::with(|cs| {
            let q = self.queues.borrow(cs);
            if q.initialized.get() {
                return false;
            }
            q.ready.init();
            q.scheduled.init();
            q.dead.init();
            q.main.waiters.init();
            q.main.state.set(Status::Ready);
            q.main.sched.set(self);
            unsafe { q.main.link.add_back(&q.ready) };
            q.current.set(&q.main);
            q.initialized.set(true);
            true
        });
        if fresh {
            debug!("fiber: scheduler up, main {:?}", Fiber::from_cb(self.main_cb()));
        }
    }

    pub fn is_initialized(&self) -> bool {
        critical_section::with(|cs| self.queues.borrow(cs).initialized.get())
    }

    fn main_cb(&self) -> &FiberCb {
        critical_section::with(|cs| {
            let q: *const Queues = self.queues.borrow(cs);
            unsafe { &(*q).main }
        })
    }

    /// The fiber running on the ambient stack.
    pub fn main_fiber(&self) -> Option<Fiber> {
        self.is_initialized().then(|| Fiber::from_cb(self.main_cb()))
    }

    /// Start `entry` as a new fiber living in `stack`. It is queued at
    /// the tail of ready and first runs when a cede() or schedule()
    /// reaches it. `None` before init() or if the block is too small.
    pub fn create(&self, entry: fn(), stack: &'static mut [u8]) -> Option<Fiber> {
        unsafe { self.create_in(entry, stack.as_mut_ptr(), stack.len()) }
    }

    pub fn try_create(&self, entry: fn(), stack: &'static mut [u8]) -> Result<Fiber, CreateError> {
        unsafe { self.try_create_in(entry, stack.as_mut_ptr(), stack.len()) }
    }

    /// [`create`](Self::create) for memory the caller wants back later.
    ///
    /// # Safety
    /// `[base, base + len)` must be writable and left alone until the
    /// fiber is terminal and has been [`unlink`](Self::unlink)ed. It must
    /// also be large enough for everything `entry` puts on its stack;
    /// nothing checks that.
    pub unsafe fn create_in(&self, entry: fn(), base: *mut u8, len: usize) -> Option<Fiber> {
        match unsafe { self.try_create_in(entry, base, len) } {
            Ok(fiber) => Some(fiber),
            Err(e) => {
                warn!("fiber: create failed: {}", e);
                None
            }
        }
    }

    /// # Safety
    /// Same as [`create_in`](Self::create_in).
    pub unsafe fn try_create_in(
        &self,
        entry: fn(),
        base: *mut u8,
        len: usize,
    ) -> Result<Fiber, CreateError> {
        if !self.is_initialized() {
            return Err(CreateError::NotInitialized);
        }
        // carving paints the stack; keep that out of the section
        let cb = unsafe { fiber::carve(base, len, entry, self)? };
        let fiber = Fiber::from_cb(unsafe { cb.as_ref() });
        critical_section::with(|cs| {
            let q = self.queues.borrow(cs);
            unsafe { fiber.cb().link.add_back(&q.ready) };
        });
        debug!("fiber: created {:?}, {} byte block", fiber, len);
        Ok(fiber)
    }

    /// The running fiber; `None` before init().
    pub fn current(&self) -> Option<Fiber> {
        critical_section::with(|cs| self.queues.borrow(cs).current().map(Fiber::from_cb))
    }

    pub fn status(&self, fiber: impl Into<Option<Fiber>>) -> Status {
        match fiber.into() {
            Some(fiber) => critical_section::with(|_| fiber.cb().state.get()),
            None => Status::Unknown,
        }
    }

    /// Let the next ready fiber run; we stay ready and queue up behind
    /// everyone else. Returns at once if nobody else is ready.
    pub fn cede(&self) {
        let section = Section::begin();
        let q = unsafe { self.queues() };
        let Some(me) = q.current() else {
            return;
        };
        let Some(next) = q.next_ready() else {
            return;
        };
        self.switch_to(section, me, next, &q.ready);
    }

    /// Sleep until someone calls [`wakeup`](Self::wakeup) on us.
    ///
    /// With no other fiber ready this idles (wfi on target) until an
    /// interrupt makes one ready or wakes us. Without an interrupt source
    /// that never happens and the call blocks for good.
    pub fn schedule(&self) {
        let section = Section::begin();
        let q = unsafe { self.queues() };
        if q.current().is_none() {
            return;
        }
        self.suspend(section, Status::Scheduled, &q.scheduled);
    }

    /// Make a sleeping fiber ready again. Does nothing unless the fiber
    /// is in schedule() (or join()). Safe to call from an ISR.
    pub fn wakeup(&self, fiber: Fiber) {
        critical_section::with(|cs| {
            let q = self.queues.borrow(cs);
            let f = fiber.cb();
            if q.initialized.get() && f.state.get() == Status::Scheduled {
                q.make_ready(f);
            }
        });
    }

    /// Cancel a fiber that has not finished.
    ///
    /// Starting and sleeping fibers move to the dead queue at once. A
    /// ready fiber other than the caller is left alone, as is one that
    /// already finished. Cancelling yourself does not return. Anyone
    /// joined on the fiber is woken and gets no result. Not for ISRs.
    pub fn cancel(&self, fiber: Fiber) {
        let section = Section::begin();
        let q = unsafe { self.queues() };
        if !q.initialized.get() {
            return;
        }
        let f = fiber.cb();

        if q.is_current(f) {
            q.wake_waiters(f);
            self.suspend(section, Status::Cancelled, &q.dead);
            return;
        }

        match f.state.get() {
            Status::Starting | Status::Scheduled => {
                unsafe {
                    f.link.remove();
                    f.link.add_back(&q.dead);
                }
                f.state.set(Status::Cancelled);
                q.wake_waiters(f);
                drop(section);
                debug!("fiber: cancelled {:?}", fiber);
            }
            _ => {}
        }
    }

    /// Wait for `fiber` to finish and borrow its result. `None` when
    /// joining yourself or the main fiber, when the fiber was already
    /// finished or cancelled, or if it gets cancelled while we wait.
    pub fn join(&self, fiber: Fiber) -> Option<&[u8]> {
        match self.try_join(fiber) {
            Ok(data) => Some(data),
            Err(e) => {
                debug!("fiber: join {:?}: {}", fiber, e);
                None
            }
        }
    }

    pub fn try_join(&self, fiber: Fiber) -> Result<&[u8], JoinError> {
        let target = fiber.cb();
        let mut waited = false;
        loop {
            let section = Section::begin();
            let q = unsafe { self.queues() };
            let Some(me) = q.current() else {
                return Err(JoinError::NotInitialized);
            };
            if ptr::eq(me, target) {
                return Err(JoinError::SelfJoin);
            }
            if target.is_main() {
                return Err(JoinError::MainFiber);
            }

            match target.state.get() {
                Status::Dead if waited => {
                    return unsafe { target.result() }.ok_or(JoinError::MainFiber);
                }
                Status::Cancelled if waited => return Err(JoinError::Cancelled),
                state if state.is_terminal() => return Err(JoinError::Finished(state)),
                // not done yet (or a stray wakeup): sleep on its waiters
                _ => {}
            }

            self.suspend(section, Status::Scheduled, &target.waiters);
            waited = true;
        }
    }

    /// Finish the running fiber with `data` as its result. Joiners are
    /// woken, the fiber parks on the dead queue and never runs again.
    /// The main fiber has nowhere to keep a result, so its data is
    /// dropped. An entry function that simply returns ends up here too.
    pub fn done(&self, data: &[u8]) -> ! {
        trace!("fiber: done, {} byte result", data.len());
        loop {
            let mut section = Section::begin();
            let q = unsafe { self.queues() };
            let Some(me) = q.current() else {
                // nothing to finish before init(); there is nowhere to go
                section.wait_for_interrupt();
                continue;
            };
            if me.state.get().is_alive() {
                unsafe { me.store_result(data) };
                q.wake_waiters(me);
            }
            self.suspend(section, Status::Dead, &q.dead);
        }
    }

    /// Take a fiber off whatever queue still holds it, so its block can
    /// be reused. Meant for finished fibers; the running fiber is never
    /// unlinked. Calling it twice is harmless.
    pub fn unlink(&self, fiber: Fiber) {
        let state = critical_section::with(|cs| {
            let q = self.queues.borrow(cs);
            let f = fiber.cb();
            if !q.is_current(f) {
                unsafe { f.link.remove() };
            }
            f.state.get()
        });
        if state.is_alive() {
            warn!("fiber: unlinked {:?} while {}", fiber, state);
        }
    }

    /// Result of a finished fiber without joining it.
    pub fn result(&self, fiber: Fiber) -> Option<&[u8]> {
        critical_section::with(|_| unsafe { fiber.cb().result() })
    }

    /// Bytes of the fiber's stack never touched so far (stack-paint).
    pub fn stack_headroom(&self, fiber: Fiber) -> Option<usize> {
        fiber.cb().headroom()
    }

    /// Visit a queue front to back. Runs inside an atomic section, so
    /// `f` must be short and must not call back into the scheduler.
    pub fn for_each(&self, queue: Queue, mut f: impl FnMut(Fiber)) {
        critical_section::with(|cs| {
            let q = self.queues.borrow(cs);
            if !q.initialized.get() {
                return;
            }
            for link in q.head(queue).iter() {
                f(Fiber::from_cb(unsafe { cb_of(link) }));
            }
        });
    }

    pub fn queue_len(&self, queue: Queue) -> usize {
        let mut n = 0;
        self.for_each(queue, |_| n += 1);
        n
    }

    pub fn contains(&self, queue: Queue, fiber: Fiber) -> bool {
        let mut found = false;
        self.for_each(queue, |f| found |= f == fiber);
        found
    }

    // Give up the CPU in `state`, parked on `target`. Returns when we are
    // switched back to, or straight away if a wakeup() reached us while
    // we were still waiting for somebody to hand over to.
    fn suspend(&self, mut section: Section, state: Status, target: &Link) {
        let q = unsafe { self.queues() };
        let Some(me) = q.current() else {
            return;
        };
        me.state.set(state);

        let next = loop {
            if me.state.get() == Status::Ready {
                return;
            }
            if let Some(next) = q.next_ready() {
                break next;
            }
            // only an interrupt can change this; let it in
            section.wait_for_interrupt();
        };
        self.switch_to(section, me, next, target);
    }

    fn switch_to(&self, section: Section, me: &FiberCb, next: &FiberCb, target: &Link) {
        let q = unsafe { self.queues() };
        debug_assert!(q.is_current(me));
        debug_assert!(!ptr::eq(me, next));

        unsafe {
            me.link.remove();
            me.link.add_back(target);
        }
        q.current.set(next);
        q.handoff.set(section.hand_off());

        unsafe { arch::switch(me.sp.as_ptr(), next.sp.get()) };

        // running again; close the section whoever switched to us opened
        drop(unsafe { Section::resume(q.handoff.get()) });
    }

    // First code a new fiber runs, on its own stack. Never returns: after
    // the entry function the fiber goes to done() for good.
    fn bootstrap(&self, me: &FiberCb) -> ! {
        let section = unsafe { Section::resume(self.queues().handoff.get()) };
        let entry = match me.state.get() {
            Status::Starting => {
                me.state.set(Status::Ready);
                me.entry.take()
            }
            _ => None,
        };
        drop(section);

        if let Some(entry) = entry {
            entry();
        }
        self.done(&[])
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Called by the arch bootstrap stub with the fiber being started.
pub(crate) extern "C" fn fiber_entry(fiber: *const FiberCb) -> ! {
    let fiber = unsafe { &*fiber };
    let sched = unsafe { &*fiber.sched.get() };
    sched.bootstrap(fiber)
}
