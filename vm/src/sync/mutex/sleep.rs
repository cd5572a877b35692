//! A mutex that puts waiters to sleep.
//!
//! Used where the holder may block on I/O, so that contending threads yield
//! the CPU instead of spinning for the length of a disk transfer.

use super::Mutex;
use crate::sync::scheduler::{Scheduler, Tid};
use alloc::{collections::VecDeque, sync::Arc};
use core::marker::PhantomData;
use core::sync::atomic::{
    AtomicU32,
    Ordering::{AcqRel, Acquire, Release},
};
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

const NOBODY: Tid = 0;

pub struct SleepMutex<T: ?Sized> {
    scheduler: Arc<dyn Scheduler>,
    holding_thread: AtomicU32,
    wait_queue: Mutex<VecDeque<Tid>>,
    data: UnsafeCell<T>,
}

/// Must be dropped by the thread that took the lock.
pub struct SleepMutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a SleepMutex<T>,
    _not_send: PhantomData<*const ()>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for SleepMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SleepMutexGuard<'_, T> {}

impl<T> SleepMutex<T> {
    pub fn new(data: T, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            holding_thread: AtomicU32::new(NOBODY),
            wait_queue: Mutex::new(VecDeque::new()),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SleepMutex<T> {
    fn guard(&self) -> SleepMutexGuard<'_, T> {
        SleepMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    #[must_use = "Mutex is released when guard falls out of scope."]
    pub fn lock(&self) -> SleepMutexGuard<'_, T> {
        let current_tid = self.scheduler.current();
        debug_assert_ne!(
            self.holding_thread.load(Acquire),
            current_tid,
            "thread {current_tid} locked a sleep mutex twice"
        );

        loop {
            // Set by `unlock` when it hands the mutex straight to us.
            if self.holding_thread.load(Acquire) == current_tid {
                break;
            }

            // Trying again under the queue lock means an `unlock` cannot slip
            // in between our failed attempt and our joining the queue.
            let mut wait_queue = self.wait_queue.lock();
            if self
                .holding_thread
                .compare_exchange(NOBODY, current_tid, AcqRel, Acquire)
                .is_ok()
            {
                break;
            }
            if !wait_queue.contains(&current_tid) {
                wait_queue.push_back(current_tid);
            }
            drop(wait_queue);

            self.scheduler.sleep();
        }

        self.guard()
    }

    pub fn try_lock(&self) -> Option<SleepMutexGuard<'_, T>> {
        let current_tid = self.scheduler.current();
        self.holding_thread
            .compare_exchange(NOBODY, current_tid, AcqRel, Acquire)
            .ok()
            .map(|_| self.guard())
    }

    pub fn is_locked(&self) -> bool {
        self.holding_thread.load(Acquire) != NOBODY
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        let mut wait_queue = self.wait_queue.lock();
        match wait_queue.pop_front() {
            None => self.holding_thread.store(NOBODY, Release),
            Some(next_thread) => {
                self.holding_thread.store(next_thread, Release);
                drop(wait_queue);
                self.scheduler.wakeup(next_thread);
            }
        }
    }
}

impl<T: ?Sized> fmt::Debug for SleepMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SleepMutex")
            .field("holding_thread", &self.holding_thread.load(Acquire))
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Drop for SleepMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized> Deref for SleepMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard's existence means we hold the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard's existence means we hold the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}
