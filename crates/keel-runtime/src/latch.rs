// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One-shot latch: a value that is set at most once, with waiters woken when
// it is.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Set-once value plus notify-all.
///
/// The first `set` wins; later ones are ignored, so the latch never moves
/// backwards.
pub struct Latch<T> {
    value: Mutex<Option<T>>,
    changed: Condvar,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            changed: Condvar::new(),
        }
    }

    /// Store `value` and wake every waiter.  Returns `false` if the latch was
    /// already set.
    pub fn set(&self, value: T) -> bool {
        let mut guard = self.value.lock().expect("latch lock poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        self.changed.notify_all();
        true
    }

    /// Block until the latch is set.
    pub fn wait(&self) -> T {
        let mut guard = self.value.lock().expect("latch lock poisoned");
        loop {
            if let Some(value) = guard.as_ref() {
                return value.clone();
            }
            guard = self.changed.wait(guard).expect("latch lock poisoned");
        }
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.value.lock().expect("latch lock poisoned");
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |value| value.is_none())
            .expect("latch lock poisoned");
        guard.clone()
    }

    pub fn try_get(&self) -> Option<T> {
        self.value.lock().expect("latch lock poisoned").clone()
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().expect("latch lock poisoned").is_some()
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}
