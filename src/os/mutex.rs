//! Recursive mutex primitive (sqlite3_mutex)
//!
//! A mutex that the owning thread may re-enter. The shared-cache layer
//! counts its own recursion in `want_to_lock` and only touches the
//! primitive on the outermost enter/leave, but two handles on the same
//! thread still need the primitive itself to be recursive.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct MutexState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Recursive mutex (sqlite3_mutex_alloc with SQLITE_MUTEX_RECURSIVE)
pub struct RecursiveMutex {
    state: Mutex<MutexState>,
    condvar: Condvar,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MutexState {
                owner: None,
                count: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Acquire the mutex, blocking until it is available (sqlite3_mutex_enter)
    pub fn enter(&self) {
        let tid = thread::current().id();
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match state.owner {
                None => {
                    state.owner = Some(tid);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == tid => {
                    state.count += 1;
                    return;
                }
                Some(_) => {
                    state = match self.condvar.wait(state) {
                        Ok(s) => s,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    /// Try to acquire the mutex without blocking (sqlite3_mutex_try)
    pub fn try_enter(&self) -> bool {
        let tid = thread::current().id();
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.owner {
            None => {
                state.owner = Some(tid);
                state.count = 1;
                true
            }
            Some(owner) if owner == tid => {
                state.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release the mutex (sqlite3_mutex_leave)
    ///
    /// Must be called by the owning thread.
    pub fn leave(&self) {
        let tid = thread::current().id();
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_assert_eq!(state.owner, Some(tid), "leave() by non-owner thread");
        if state.owner == Some(tid) {
            state.count -= 1;
            if state.count == 0 {
                state.owner = None;
                self.condvar.notify_one();
            }
        }
    }

    /// True when the calling thread holds the mutex (sqlite3_mutex_held)
    pub fn held(&self) -> bool {
        let tid = thread::current().id();
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.owner == Some(tid)
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recursive_enter() {
        let m = RecursiveMutex::new();
        m.enter();
        m.enter();
        assert!(m.held());
        m.leave();
        assert!(m.held(), "mutex released too early");
        m.leave();
        assert!(!m.held());
    }

    #[test]
    fn test_try_enter_contended() {
        let m = Arc::new(RecursiveMutex::new());
        m.enter();

        let m2 = m.clone();
        let handle = thread::spawn(move || m2.try_enter());
        assert!(
            !handle.join().unwrap(),
            "try_enter should fail while another thread holds the mutex"
        );

        m.leave();
        let m3 = m.clone();
        let handle = thread::spawn(move || {
            let ok = m3.try_enter();
            if ok {
                m3.leave();
            }
            ok
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_blocking_handoff() {
        let m = Arc::new(RecursiveMutex::new());
        m.enter();

        let m2 = m.clone();
        let handle = thread::spawn(move || {
            m2.enter();
            m2.leave();
        });

        thread::sleep(std::time::Duration::from_millis(10));
        m.leave();
        handle.join().unwrap();
        assert!(!m.held());
    }
}
