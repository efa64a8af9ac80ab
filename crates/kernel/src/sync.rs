// Spinlock with misuse detection
// ------------------------------
// Test-and-set lock in the xv6 mold. The scheduler is the one structure
// every hart mutates on every trip around its run loop, so it sits behind
// this lock rather than a blocking mutex: contention windows are a few
// dozen instructions and the waiters are dedicated OS threads.
//
// Misuse is fatal by policy: re-acquiring on the thread that already holds
// the lock, or releasing without holding it, indicates a kernel bug and
// panics rather than deadlocking or corrupting.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-unique identifier for the current thread (thread IDs are opaque
/// in std, so we mint our own).
fn current_thread_tag() -> u64 {
    use std::cell::Cell;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TAG: Cell<u64> = const { Cell::new(0) };
    }
    TAG.with(|tag| {
        if tag.get() == 0 {
            tag.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        tag.get()
    })
}

const NO_OWNER: u64 = 0;

pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    owner: AtomicU64,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is held. Panics if this thread already holds it.
    pub fn acquire(&self) -> SpinGuard<'_, T> {
        let me = current_thread_tag();
        if self.holding(me) {
            panic!("spinlock '{}': acquire while already holding", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        self.owner.store(me, Ordering::Relaxed);
        SpinGuard { lock: self }
    }

    fn holding(&self, me: u64) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == me
    }

    fn release(&self) {
        let me = current_thread_tag();
        if !self.holding(me) {
            panic!("spinlock '{}': release without holding", self.name);
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
