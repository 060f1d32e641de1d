// Intrusive circular doubly-linked list
//
// Every fiber queue (ready, scheduled, dead, join waiters) is a Link head
// with the member Links embedded in the fiber control blocks. No
// allocation; all splices are O(1). Links use Cell so the lists can be
// mutated through shared references while a critical section is held.
//
// A head must be init()ed in place before use; a Link that is not in any
// list has null pointers, which makes remove() on it a harmless no-op.

use core::cell::Cell;
use core::ptr::{self, NonNull};

pub struct Link {
    next: Cell<*const Link>,
    prev: Cell<*const Link>,
}

impl Link {
    /// An unlinked node (or an uninitialised head).
    pub const fn new() -> Self {
        Self {
            next: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null()),
        }
    }

    /// Make this link an empty, self-referential list head.
    pub fn init(&self) {
        self.next.set(self);
        self.prev.set(self);
    }

    pub fn is_empty(&self) -> bool {
        ptr::eq(self.next.get(), self)
    }

    /// True while this node sits in some list.
    pub fn is_linked(&self) -> bool {
        let next = self.next.get();
        !next.is_null() && !ptr::eq(next, self)
    }

    // splice self between two adjacent nodes
    unsafe fn insert(&self, prev: *const Link, next: *const Link) {
        unsafe {
            (*next).prev.set(self);
            self.next.set(next);
            self.prev.set(prev);
            (*prev).next.set(self);
        }
    }

    /// Insert right after `head`.
    ///
    /// # Safety
    /// `head` must be an initialised head and `self` must not be in a list.
    pub unsafe fn add_front(&self, head: &Link) {
        unsafe { self.insert(head, head.next.get()) }
    }

    /// Insert right before `head`, i.e. at the tail.
    ///
    /// # Safety
    /// `head` must be an initialised head and `self` must not be in a list.
    pub unsafe fn add_back(&self, head: &Link) {
        unsafe { self.insert(head.prev.get(), head) }
    }

    /// Unlink and poison with nulls. Removing an unlinked node does nothing.
    ///
    /// # Safety
    /// If linked, the neighbours must still be live.
    pub unsafe fn remove(&self) {
        let next = self.next.get();
        let prev = self.prev.get();
        if next.is_null() || prev.is_null() {
            return;
        }
        unsafe {
            (*next).prev.set(prev);
            (*prev).next.set(next);
        }
        self.next.set(ptr::null());
        self.prev.set(ptr::null());
    }

    /// Unlink and leave as an empty head, ready for reuse.
    ///
    /// # Safety
    /// Same as [`Link::remove`].
    pub unsafe fn remove_and_reinit(&self) {
        unsafe { self.remove() };
        self.init();
    }

    /// First member, if any.
    pub fn first(&self) -> Option<NonNull<Link>> {
        self.nth(0)
    }

    /// The member at position `n` (0 = first after the head).
    pub fn nth(&self, n: usize) -> Option<NonNull<Link>> {
        self.iter().nth(n)
    }

    /// Lazy front-to-back walk. Do not splice the list while iterating;
    /// restart with a fresh `iter()` after any mutation.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            head: self,
            cur: self.next.get(),
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a> {
    head: &'a Link,
    cur: *const Link,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<Link>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() || ptr::eq(self.cur, self.head) {
            return None;
        }
        let node = self.cur;
        self.cur = unsafe { (*node).next.get() };
        NonNull::new(node.cast_mut())
    }
}

/// Recover the record that embeds a [`Link`].
///
/// `entry_of!(link_ptr, Type, field)` yields `*const Type`. Must be used in
/// an unsafe context and only on links that really are `Type::field`.
#[macro_export]
macro_rules! entry_of {
    ($link:expr, $ty:ty, $field:ident) => {
        ($link as *const $crate::kernel::list::Link)
            .cast::<u8>()
            .sub(core::mem::offset_of!($ty, $field))
            .cast::<$ty>()
    };
}
