// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The backlog, the in-flight registry and the cancel registry are plain
//! `std::sync` maps shared between the queue worker, job tasks and HTTP
//! handlers. A job task that panics while holding one of them must not take
//! the whole service down with it, so every acquisition goes through these
//! helpers: a poisoned lock is logged and its guard recovered.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use romfetch::sync::resilient_lock;
//!
//! let backlog = Mutex::new(Vec::<u64>::new());
//! resilient_lock(&backlog).push(7);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if a writer panicked.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "sync",
            event = "LOCK_POISONED_READ",
            "RwLock poisoned during read; a job task panicked while holding it. Recovering."
        );
        poisoned.into_inner()
    })
}

/// Acquire a write lock, recovering the guard if a holder panicked.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "sync",
            event = "LOCK_POISONED_WRITE",
            "RwLock poisoned during write; a job task panicked while holding it. Recovering."
        );
        poisoned.into_inner()
    })
}

/// Acquire a mutex, recovering the guard if a holder panicked.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "sync",
            event = "LOCK_POISONED_MUTEX",
            "Mutex poisoned; a job task panicked while holding it. Recovering."
        );
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_write_unpoisoned() {
        let lock = RwLock::new(1);
        *resilient_write(&lock) += 1;
        assert_eq!(*resilient_read(&lock), 2);
    }

    #[test]
    fn test_recovers_poisoned_rwlock() {
        let lock = Arc::new(RwLock::new(vec![1, 2]));
        let poisoner = lock.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("job task died");
        })
        .join();

        assert!(lock.is_poisoned());
        resilient_write(&lock).push(3);
        assert_eq!(*resilient_read(&lock), vec![1, 2, 3]);
    }

    #[test]
    fn test_recovers_poisoned_mutex() {
        let lock = Arc::new(Mutex::new(0u32));
        let poisoner = lock.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("job task died");
        })
        .join();

        *resilient_lock(&lock) += 5;
        assert_eq!(*resilient_lock(&lock), 5);
    }
}
