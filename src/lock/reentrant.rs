//! Thread-aware reentrant RW lock on top of `parking_lot`'s raw primitive.

use crate::error::LockStateError;
use crate::metrics::CoreMetrics;
use parking_lot::lock_api::{RawRwLock as _, RawRwLockTimed as _};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread bookkeeping for one lock instance.
#[derive(Debug, Clone, Copy, Default)]
struct ThreadState {
    state: i32,
    released_early: bool,
}

thread_local! {
    static THREAD_STATES: RefCell<HashMap<u64, ThreadState>> = RefCell::new(HashMap::new());
}

/// Hold held by the current thread on a [`ReentrantRwLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Write hold with the given recursion depth.
    Write(u32),
    /// Read hold with the given recursion depth.
    Read(u32),
}

/// Side effects run on real (non-recursive) write acquisition and release.
pub trait LockObserver: Send + Sync + std::fmt::Debug {
    /// Called after the underlying write lock was acquired.
    fn on_write_acquired(&self) {}

    /// Called before the underlying write lock is released.
    fn on_write_released(&self) {}
}

/// A reentrant reader/writer lock with per-thread recursion tracking.
///
/// The lock protects no data of its own; it serializes callers that agree to
/// take it. Lock and unlock calls must be balanced on the same thread. An
/// unbalanced unlock is a caller bug and panics with a [`LockStateError`].
pub struct ReentrantRwLock {
    id: u64,
    raw: parking_lot::RawRwLock,
    observers: Vec<Arc<dyn LockObserver>>,
    metrics: Option<Arc<CoreMetrics>>,
}

impl std::fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantRwLock")
            .field("id", &self.id)
            .field("observers", &self.observers.len())
            .field("current_thread", &self.state())
            .finish()
    }
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantRwLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            raw: <parking_lot::RawRwLock as parking_lot::lock_api::RawRwLock>::INIT,
            observers: Vec::new(),
            metrics: None,
        }
    }

    /// Register an observer for write acquisition and release.
    pub fn with_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Record acquisitions into the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<CoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn load(&self) -> ThreadState {
        THREAD_STATES.with(|states| states.borrow().get(&self.id).copied().unwrap_or_default())
    }

    fn store(&self, ts: ThreadState) {
        THREAD_STATES.with(|states| {
            let mut states = states.borrow_mut();
            if ts.state == 0 && !ts.released_early {
                states.remove(&self.id);
            } else {
                states.insert(self.id, ts);
            }
        });
    }

    fn set_state(&self, state: i32) {
        let mut ts = self.load();
        ts.state = state;
        self.store(ts);
    }

    fn record_recursive(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_recursive_acquired.inc();
        }
    }

    fn write_acquired(&self) {
        self.set_state(1);
        for observer in &self.observers {
            observer.on_write_acquired();
        }
        if let Some(metrics) = &self.metrics {
            metrics.lock_write_acquired.inc();
        }
        tracing::trace!(lock = self.id, "write lock acquired");
    }

    fn read_acquired(&self) {
        self.set_state(-1);
        if let Some(metrics) = &self.metrics {
            metrics.lock_read_acquired.inc();
        }
    }

    fn timed_out(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_try_timeouts.inc();
        }
    }

    /// Hold currently held by the calling thread.
    pub fn state(&self) -> LockState {
        match self.load().state {
            0 => LockState::Unlocked,
            s if s > 0 => LockState::Write(s as u32),
            s => LockState::Read(s.unsigned_abs()),
        }
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        self.load().state > 0
    }

    /// Whether the calling thread holds the lock in any mode.
    pub fn is_locked(&self) -> bool {
        self.load().state != 0
    }

    /// Acquire the write lock, blocking until it is available.
    ///
    /// Recursive calls on a thread that already holds the write lock only bump
    /// the recursion depth.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds a read lock.
    pub fn lock_write(&self) {
        let s = self.load().state;
        if s > 0 {
            self.set_state(s + 1);
            self.record_recursive();
            return;
        }
        if s < 0 {
            panic!(
                "{}",
                LockStateError::UpgradeNotSupported {
                    depth: s.unsigned_abs()
                }
            );
        }
        self.raw.lock_exclusive();
        self.write_acquired();
    }

    /// Try to acquire the write lock within `timeout`.
    ///
    /// Returns `false` on timeout without running any side effects.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds a read lock.
    pub fn try_lock_write(&self, timeout: Duration) -> bool {
        let s = self.load().state;
        if s > 0 {
            self.set_state(s + 1);
            self.record_recursive();
            return true;
        }
        if s < 0 {
            panic!(
                "{}",
                LockStateError::UpgradeNotSupported {
                    depth: s.unsigned_abs()
                }
            );
        }
        if self.raw.try_lock_exclusive_for(timeout) {
            self.write_acquired();
            true
        } else {
            self.timed_out();
            tracing::debug!(lock = self.id, ?timeout, "write lock attempt timed out");
            false
        }
    }

    /// Release one write hold.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds no write lock and has no pending early
    /// release.
    pub fn unlock_write(&self) {
        let mut ts = self.load();
        if ts.state > 1 {
            ts.state -= 1;
            self.store(ts);
            return;
        }
        if ts.state != 1 {
            if ts.released_early {
                ts.released_early = false;
                self.store(ts);
                return;
            }
            if ts.state < 0 {
                panic!(
                    "{}",
                    LockStateError::ReadHeld {
                        depth: ts.state.unsigned_abs()
                    }
                );
            }
            panic!("{}", LockStateError::NotHeld { mode: "write" });
        }

        for observer in &self.observers {
            observer.on_write_released();
        }
        self.set_state(0);
        // SAFETY: state 1 means this thread acquired the exclusive lock and has
        // not released it.
        unsafe { self.raw.unlock_exclusive() };
        tracing::trace!(lock = self.id, "write lock released");
    }

    /// Release the write lock now; the next [`unlock_write`](Self::unlock_write)
    /// on this thread becomes a no-op.
    ///
    /// # Panics
    ///
    /// Panics unless the calling thread holds exactly one write hold with no
    /// early release pending.
    pub fn release_early(&self) {
        let mut ts = self.load();
        if ts.state != 1 || ts.released_early {
            panic!("{}", LockStateError::ReleaseEarly { state: ts.state });
        }
        ts.released_early = true;
        self.store(ts);
        self.unlock_write();
        tracing::debug!(lock = self.id, "write lock released early");
    }

    /// Acquire a read lock, blocking until it is available.
    ///
    /// A thread holding the write lock keeps it and only bumps the write depth.
    pub fn lock_read(&self) {
        let s = self.load().state;
        if s != 0 {
            self.set_state(if s > 0 { s + 1 } else { s - 1 });
            self.record_recursive();
            return;
        }
        self.raw.lock_shared();
        self.read_acquired();
    }

    /// Try to acquire a read lock within `timeout`.
    pub fn try_lock_read(&self, timeout: Duration) -> bool {
        let s = self.load().state;
        if s != 0 {
            self.set_state(if s > 0 { s + 1 } else { s - 1 });
            self.record_recursive();
            return true;
        }
        if self.raw.try_lock_shared_for(timeout) {
            self.read_acquired();
            true
        } else {
            self.timed_out();
            tracing::debug!(lock = self.id, ?timeout, "read lock attempt timed out");
            false
        }
    }

    /// Release one read hold.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds nothing, or if the release would drop
    /// the write lock itself.
    pub fn unlock_read(&self) {
        let s = self.load().state;
        if s > 0 {
            // Read holds taken under a write lock are counted in the write depth.
            if s == 1 {
                panic!("{}", LockStateError::WriteHeld);
            }
            self.set_state(s - 1);
            return;
        }
        if s < -1 {
            self.set_state(s + 1);
            return;
        }
        if s == 0 {
            panic!("{}", LockStateError::NotHeld { mode: "read" });
        }
        self.set_state(0);
        // SAFETY: state -1 means this thread acquired a shared lock and has not
        // released it.
        unsafe { self.raw.unlock_shared() };
    }

    /// Acquire the write lock and return a guard releasing it on drop.
    pub fn write(&self) -> WriteGuard<'_> {
        self.lock_write();
        WriteGuard::new(self)
    }

    /// Try to acquire the write lock within `timeout`.
    pub fn try_write(&self, timeout: Duration) -> Option<WriteGuard<'_>> {
        self.try_lock_write(timeout).then(|| WriteGuard::new(self))
    }

    /// Acquire a read lock and return a guard releasing it on drop.
    pub fn read(&self) -> ReadGuard<'_> {
        self.lock_read();
        ReadGuard::new(self)
    }

    /// Try to acquire a read lock within `timeout`.
    pub fn try_read(&self, timeout: Duration) -> Option<ReadGuard<'_>> {
        self.try_lock_read(timeout).then(|| ReadGuard::new(self))
    }
}

/// RAII write hold. Must be dropped on the thread that created it.
#[must_use = "the lock is released when the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteGuard<'a> {
    fn new(lock: &'a ReentrantRwLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Release the underlying write lock before the guard goes out of scope.
    ///
    /// The guard's own drop then consumes the early-release flag.
    pub fn release_early(self) {
        self.lock.release_early();
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

/// RAII read hold. Must be dropped on the thread that created it.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    fn new(lock: &'a ReentrantRwLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}
