//! Per-handle mutual exclusion.
//!
//! Every database handle serializes its pager and B-tree calls through one
//! [`DbMutex`]. Handles shared between threads use [`ReentrantMutex`];
//! handles that are known to stay on one thread use [`NoopMutex`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

pub trait DbMutex: Send + Sync {
    /// Block until the calling thread owns the mutex. Re-entrant.
    fn enter(&self);

    /// Take the mutex if that is possible without blocking.
    fn attempt(&self) -> bool;

    /// Release one level of ownership.
    fn leave(&self);

    /// True when the calling thread owns the mutex.
    fn held(&self) -> bool;
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Blocking, re-entrant mutex.
#[derive(Debug, Default)]
pub struct ReentrantMutex {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl ReentrantMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DbMutex for ReentrantMutex {
    fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    fn attempt(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn leave(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, Some(me), "mutex released by a thread that does not own it");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }

    fn held(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

/// Mutex for handles confined to a single thread.
///
/// It only counts nesting. The first thread to enter becomes the owner for
/// the mutex's lifetime; entering from any other thread panics.
#[derive(Debug, Default)]
pub struct NoopMutex {
    /// Tag of the owning thread, 0 until the first `enter`.
    owner: AtomicU64,
    depth: AtomicUsize,
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

fn thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

impl NoopMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&self) {
        let me = thread_tag();
        if let Err(owner) = self
            .owner
            .compare_exchange(0, me, Ordering::Relaxed, Ordering::Relaxed)
        {
            assert_eq!(owner, me, "single-threaded database handle used from another thread");
        }
    }
}

impl DbMutex for NoopMutex {
    fn enter(&self) {
        self.bind();
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    fn attempt(&self) -> bool {
        self.enter();
        true
    }

    fn leave(&self) {
        self.bind();
        let depth = self.depth.load(Ordering::Relaxed);
        assert!(depth > 0, "mutex released more often than entered");
        self.depth.store(depth - 1, Ordering::Relaxed);
    }

    fn held(&self) -> bool {
        self.depth.load(Ordering::Relaxed) > 0 && self.owner.load(Ordering::Relaxed) == thread_tag()
    }
}

/// Pick the implementation for a handle.
pub fn for_handle(threadsafe: bool) -> Box<dyn DbMutex> {
    if threadsafe {
        Box::new(ReentrantMutex::new())
    } else {
        Box::new(NoopMutex::new())
    }
}

struct Held<'a>(&'a dyn DbMutex);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Run `f` while holding `mutex`. The mutex is released afterwards even
/// if `f` panics.
pub fn run<T>(mutex: &dyn DbMutex, f: impl FnOnce() -> T) -> T {
    mutex.enter();
    let _held = Held(mutex);
    f()
}

/// Like [`run`], but fails with [`Error::Locked`] instead of waiting.
pub fn try_run<T>(mutex: &dyn DbMutex, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if !mutex.attempt() {
        return Err(Error::Locked);
    }
    let _held = Held(mutex);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_nesting() {
        let m = ReentrantMutex::new();
        assert!(!m.held());
        m.enter();
        m.enter();
        assert!(m.held());
        m.leave();
        assert!(m.held());
        m.leave();
        assert!(!m.held());
    }

    #[test]
    fn test_attempt_from_other_thread_fails() {
        let m = Arc::new(ReentrantMutex::new());
        m.enter();
        let other = m.clone();
        let got = thread::spawn(move || other.attempt()).join().expect("thread panicked");
        assert!(!got);
        m.leave();

        let other = m.clone();
        let got = thread::spawn(move || {
            let ok = other.attempt();
            if ok {
                other.leave();
            }
            ok
        })
        .join()
        .expect("thread panicked");
        assert!(got);
    }

    #[test]
    fn test_run_serializes_threads() {
        let m: Arc<ReentrantMutex> = Arc::new(ReentrantMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        run(m.as_ref(), || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            thread::sleep(Duration::from_micros(50));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker panicked");
        }
    }

    #[test]
    fn test_run_releases_on_panic() {
        let m = ReentrantMutex::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run(&m, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!m.held());
    }

    #[test]
    fn test_run_result_shapes() -> anyhow::Result<()> {
        let m = ReentrantMutex::new();
        assert_eq!(run(&m, || 7), 7);
        assert!(run(&m, || true));
        run(&m, || ());
        assert_eq!(try_run(&m, || Ok(3))?, 3);
        Ok(())
    }

    #[test]
    fn test_try_run_reports_locked() {
        let m = Arc::new(ReentrantMutex::new());
        m.enter();
        let other = m.clone();
        let result = thread::spawn(move || try_run(other.as_ref(), || Ok(())))
            .join()
            .expect("thread panicked");
        assert!(matches!(result, Err(Error::Locked)));
        m.leave();
    }

    #[test]
    fn test_noop_counts_depth() {
        let m = NoopMutex::new();
        m.enter();
        assert!(m.attempt());
        assert!(m.held());
        m.leave();
        m.leave();
        assert!(!m.held());
    }

    #[test]
    fn test_noop_rejects_second_thread() {
        let m = Arc::new(NoopMutex::new());
        m.enter();
        m.leave();
        let other = m.clone();
        let result = thread::spawn(move || other.enter()).join();
        assert!(result.is_err());
    }

    #[test]
    fn test_noop_held_only_by_owner() {
        let m = Arc::new(NoopMutex::new());
        m.enter();
        let other = m.clone();
        let seen = thread::spawn(move || other.held()).join().expect("thread panicked");
        assert!(!seen);
        assert!(m.held());
        m.leave();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| m.leave()));
        assert!(result.is_err());
    }
}
