//! Lock levels and ordered lock wrappers.
//!
//! Every lock shared between search workers, helper workers and the
//! controller belongs to a level. Levels are acquired in this order:
//!
//! ```text
//! Tree -> Lifecycle -> AuxQueue -> PvQueue -> EngineIo -> PvCache
//! ```
//!
//! Locking level `M` requires a [`LockToken`] for a level `L` with
//! `M: LockAfter<L>`. The returned guard holds the caller's token mutably
//! borrowed and hands out a token for `M`, so while it lives only strictly
//! later levels can be taken. Acquiring out of order does not compile:
//!
//! ```compile_fail
//! use aux_mcts::locks::{AuxQueueLock, LockToken, OrderedMutex, TreeLock, OrderedRwLock};
//!
//! let tree = OrderedRwLock::<TreeLock, u32>::new(0);
//! let queue = OrderedMutex::<AuxQueueLock, u32>::new(0);
//! let mut token = LockToken::new();
//! let mut q = queue.lock(&mut token);
//! let _t = tree.read(q.token()); // Tree is not after AuxQueue
//! ```
//!
//! Each thread creates its root token with [`LockToken::new`] at its entry
//! point (or in a `Drop` that runs outside any lock). Tokens are neither
//! `Send` nor `Sync`. Ordered guards alive on the current thread are
//! counted, and a root token cannot be created while any of them lives, so
//! a fresh token never bypasses a held level.
//!
//! Leaf locks that are never held while acquiring another lock (signals,
//! the evaluation cache, parked engine handles) use `parking_lot` directly.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

mod sealed {
    pub trait Sealed {}
}

/// A position in the global acquisition order.
pub trait LockLevel: sealed::Sealed {}

/// Implemented by `Self` when it may be acquired while `Held` is held.
pub trait LockAfter<Held: LockLevel>: LockLevel {}

macro_rules! lock_levels {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub enum $name {}
            impl sealed::Sealed for $name {}
            impl LockLevel for $name {}
        )*
    };
}

macro_rules! lock_after {
    ($level:ident: $($held:ident),+) => {
        $(impl LockAfter<$held> for $level {})+
    };
}

lock_levels! {
    /// No lock held.
    Unlocked,
    /// The search tree.
    TreeLock,
    /// Game and move lifecycle flags.
    LifecycleLock,
    /// Node-work queue feeding helper engines.
    AuxQueueLock,
    /// PV-injection queue feeding search workers.
    PvQueueLock,
    /// One helper engine's input stream and stop flag.
    EngineIoLock,
    /// PV deduplication cache.
    PvCacheLock,
}

lock_after!(TreeLock: Unlocked);
lock_after!(LifecycleLock: Unlocked, TreeLock);
lock_after!(AuxQueueLock: Unlocked, TreeLock, LifecycleLock);
lock_after!(PvQueueLock: Unlocked, TreeLock, LifecycleLock, AuxQueueLock);
lock_after!(EngineIoLock: Unlocked, TreeLock, LifecycleLock, AuxQueueLock, PvQueueLock);
lock_after!(PvCacheLock: Unlocked, TreeLock, LifecycleLock, AuxQueueLock, PvQueueLock, EngineIoLock);

/// Proof that the current thread holds a lock of level `L`.
pub struct LockToken<L: LockLevel> {
    _level: PhantomData<(fn() -> L, *const ())>,
}

impl LockToken<Unlocked> {
    /// Root token for a thread holding no locks.
    ///
    /// # Panics
    ///
    /// If the current thread holds an ordered lock. Use [`LockToken::try_new`]
    /// where that is not known.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        match Self::try_new() {
            Some(token) => token,
            None => panic!("root lock token created while {} ordered lock(s) are held", held_locks()),
        }
    }

    /// Root token, or `None` if the current thread holds an ordered lock.
    pub fn try_new() -> Option<Self> {
        (held_locks() == 0).then(|| Self { _level: PhantomData })
    }
}

thread_local! {
    static HELD: Cell<usize> = const { Cell::new(0) };
}

/// Ordered guards alive on the current thread.
pub fn held_locks() -> usize {
    HELD.with(Cell::get)
}

/// Counts one ordered guard for the current thread while it lives.
struct HeldMark(PhantomData<*const ()>);

impl HeldMark {
    fn acquire() -> Self {
        HELD.with(|held| held.set(held.get() + 1));
        HeldMark(PhantomData)
    }
}

impl Drop for HeldMark {
    fn drop(&mut self) {
        HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

impl<L: LockLevel> LockToken<L> {
    fn held() -> Self {
        Self { _level: PhantomData }
    }
}

// =============================================================================
// Mutex
// =============================================================================

/// A `parking_lot::Mutex` tagged with a lock level.
pub struct OrderedMutex<L: LockLevel, T> {
    inner: Mutex<T>,
    _level: PhantomData<fn() -> L>,
}

impl<L: LockLevel, T> OrderedMutex<L, T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            _level: PhantomData,
        }
    }

    pub fn lock<'a, H: LockLevel>(&'a self, _held: &'a mut LockToken<H>) -> OrderedMutexGuard<'a, L, T>
    where
        L: LockAfter<H>,
    {
        OrderedMutexGuard {
            guard: self.inner.lock(),
            token: LockToken::held(),
            _mark: HeldMark::acquire(),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct OrderedMutexGuard<'a, L: LockLevel, T> {
    guard: MutexGuard<'a, T>,
    token: LockToken<L>,
    _mark: HeldMark,
}

impl<L: LockLevel, T> OrderedMutexGuard<'_, L, T> {
    /// Token for acquiring later levels while this guard is held.
    pub fn token(&mut self) -> &mut LockToken<L> {
        &mut self.token
    }

    /// Data and token at once.
    pub fn split(&mut self) -> (&mut T, &mut LockToken<L>) {
        (&mut *self.guard, &mut self.token)
    }
}

impl<L: LockLevel, T> Deref for OrderedMutexGuard<'_, L, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<L: LockLevel, T> DerefMut for OrderedMutexGuard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Condition variable paired with an [`OrderedMutex`].
#[derive(Default)]
pub struct OrderedCondvar {
    inner: Condvar,
}

impl OrderedCondvar {
    pub fn new() -> Self {
        Self { inner: Condvar::new() }
    }

    /// Wait for a notification or until `timeout` passes. Returns true on timeout.
    pub fn wait_for<L: LockLevel, T>(&self, guard: &mut OrderedMutexGuard<'_, L, T>, timeout: Duration) -> bool {
        self.inner.wait_for(&mut guard.guard, timeout).timed_out()
    }

    pub fn notify_one(&self) -> bool {
        self.inner.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.inner.notify_all()
    }
}

// =============================================================================
// RwLock
// =============================================================================

/// A `parking_lot::RwLock` tagged with a lock level.
pub struct OrderedRwLock<L: LockLevel, T> {
    inner: RwLock<T>,
    _level: PhantomData<fn() -> L>,
}

impl<L: LockLevel, T> OrderedRwLock<L, T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
            _level: PhantomData,
        }
    }

    pub fn read<'a, H: LockLevel>(&'a self, _held: &'a mut LockToken<H>) -> OrderedReadGuard<'a, L, T>
    where
        L: LockAfter<H>,
    {
        OrderedReadGuard {
            guard: self.inner.read(),
            token: LockToken::held(),
            _mark: HeldMark::acquire(),
        }
    }

    pub fn write<'a, H: LockLevel>(&'a self, _held: &'a mut LockToken<H>) -> OrderedWriteGuard<'a, L, T>
    where
        L: LockAfter<H>,
    {
        OrderedWriteGuard {
            guard: self.inner.write(),
            token: LockToken::held(),
            _mark: HeldMark::acquire(),
        }
    }
}

pub struct OrderedReadGuard<'a, L: LockLevel, T> {
    guard: RwLockReadGuard<'a, T>,
    token: LockToken<L>,
    _mark: HeldMark,
}

impl<L: LockLevel, T> OrderedReadGuard<'_, L, T> {
    pub fn token(&mut self) -> &mut LockToken<L> {
        &mut self.token
    }

    pub fn split(&mut self) -> (&T, &mut LockToken<L>) {
        (&*self.guard, &mut self.token)
    }
}

impl<L: LockLevel, T> Deref for OrderedReadGuard<'_, L, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct OrderedWriteGuard<'a, L: LockLevel, T> {
    guard: RwLockWriteGuard<'a, T>,
    token: LockToken<L>,
    _mark: HeldMark,
}

impl<L: LockLevel, T> OrderedWriteGuard<'_, L, T> {
    pub fn token(&mut self) -> &mut LockToken<L> {
        &mut self.token
    }

    pub fn split(&mut self) -> (&mut T, &mut LockToken<L>) {
        (&mut *self.guard, &mut self.token)
    }
}

impl<L: LockLevel, T> Deref for OrderedWriteGuard<'_, L, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<L: LockLevel, T> DerefMut for OrderedWriteGuard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
