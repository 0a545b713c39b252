//! A writer-preferring reader-writer lock.
//!
//! The standard library's `RwLock` leaves the reader/writer priority policy to
//! the OS, which on some platforms lets a continuous stream of readers starve
//! a writer indefinitely. The store cannot tolerate that: a put that never
//! gets the write lock never commits. This lock makes the policy explicit --
//! while any writer is waiting, newly arriving readers block.
//!
//! Recursive acquisition is not supported; a thread that already holds a read
//! guard and asks for another will deadlock if a writer is queued between the
//! two acquisitions.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

#[derive(Default)]
struct LockState {
    active_readers: usize,
    waiting_writers: usize,
    writer_active: bool,
}

/// A reader-writer lock protecting a value of type `T`, with writer preference.
///
/// Any number of readers may hold the lock concurrently; a writer is
/// exclusive. A waiting writer blocks newly arriving readers, so a writer's
/// wait is bounded by the readers already active when it arrived.
pub struct RwLock<T> {
    state: Mutex<LockState>,
    readers_ok: Condvar,
    writers_ok: Condvar,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is mediated by the reader/writer protocol above.
// A ReadGuard only hands out `&T` while no writer is active; a WriteGuard is
// exclusive. The same reasoning std::sync::RwLock uses applies here.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// wrap `value` in a new, unlocked lock
    pub fn new(value: T) -> Self {
        RwLock {
            state: Mutex::new(LockState::default()),
            readers_ok: Condvar::new(),
            writers_ok: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// acquire the lock for shared read access, blocking while a writer is
    /// active or waiting
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.writer_active || state.waiting_writers > 0 {
            self.readers_ok.wait(&mut state);
        }
        state.active_readers += 1;
        ReadGuard { lock: self }
    }

    /// acquire the lock for exclusive write access, blocking until all active
    /// readers and any active writer have released
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer_active || state.active_readers > 0 {
            self.writers_ok.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer_active = true;
        WriteGuard { lock: self }
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.active_readers -= 1;
        if state.active_readers == 0 {
            self.writers_ok.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer_active = false;
        if state.waiting_writers > 0 {
            self.writers_ok.notify_one();
        } else {
            self.readers_ok.notify_all();
        }
    }
}

/// RAII guard for shared read access; derefs to `&T`
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII guard for exclusive write access; derefs to `&mut T`
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
