//! Wait conditions bridging interrupt context and blocked callers.
//!
//! The interrupt handler only ever calls [`WaitQueue::wake_all`]. Waiters own all the real
//! work: after every wake-up they re-evaluate their predicate against the control page, so
//! spurious wake-ups are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

use crate::error::{ModemError, Result};

/// Lock helpers ignoring poisoning: the protected state is always left consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct WaitInner {
    /// Wake-up counter; only used to give the condvar something to guard.
    events: Mutex<u64>,
    cond: Condvar,
}

#[derive(Clone, Default)]
pub struct WaitQueue {
    inner: Arc<WaitInner>,
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("events", &*lock(&self.inner.events))
            .finish()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_all(&self) {
        let mut events = lock(&self.inner.events);
        *events = events.wrapping_add(1);
        self.inner.cond.notify_all();
    }

    /// Blocks until `condition` holds or `cancel` fires.
    ///
    /// The predicate is evaluated with the queue's internal lock held, so a `wake_all` issued
    /// after the peer updated shared state can never be lost.
    pub fn wait_event(
        &self,
        cancel: &CancelToken,
        mut condition: impl FnMut() -> bool,
    ) -> Result<()> {
        cancel.park(self);
        let mut events = lock(&self.inner.events);
        let res = loop {
            if condition() {
                break Ok(());
            }
            if cancel.is_cancelled() {
                break Err(ModemError::Interrupted);
            }
            events = self
                .inner
                .cond
                .wait(events)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(events);
        cancel.unpark(self);
        res
    }

    /// Blocks until `condition` holds or `timeout` elapses. Returns whether it held.
    pub fn wait_event_timeout(
        &self,
        timeout: Duration,
        mut condition: impl FnMut() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.inner.events);
        loop {
            if condition() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .inner
                .cond
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn same_queue(&self, other: &WaitQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    parked: Mutex<Vec<WaitQueue>>,
}

/// External cancellation signal for blocking waits (the terminate request a waiting thread
/// receives).
///
/// Cancelling wakes every queue the token's holders are currently blocked on; the waits then
/// return [`ModemError::Interrupted`] without touching ring state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl core::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let parked = lock(&self.inner.parked).clone();
        for queue in parked {
            queue.wake_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Re-arms the token after a handled cancellation.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
    }

    fn park(&self, queue: &WaitQueue) {
        lock(&self.inner.parked).push(queue.clone());
    }

    fn unpark(&self, queue: &WaitQueue) {
        let mut parked = lock(&self.inner.parked);
        if let Some(pos) = parked.iter().position(|q| q.same_queue(queue)) {
            parked.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_condition_holds() {
        let wq = WaitQueue::new();
        wq.wait_event(&CancelToken::new(), || true).unwrap();
    }

    #[test]
    fn wake_all_releases_waiter_after_state_change() {
        let wq = WaitQueue::new();
        let flag = Arc::new(AtomicU32::new(0));

        let waiter = {
            let wq = wq.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                wq.wait_event(&CancelToken::new(), || flag.load(Ordering::SeqCst) == 1)
            })
        };

        // Spurious wake: condition still false, waiter must keep waiting.
        wq.wake_all();
        flag.store(1, Ordering::SeqCst);
        wq.wake_all();

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn cancel_interrupts_blocked_waiter() {
        let wq = WaitQueue::new();
        let token = CancelToken::new();

        let waiter = {
            let wq = wq.clone();
            let token = token.clone();
            thread::spawn(move || wq.wait_event(&token, || false))
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(waiter.join().unwrap(), Err(ModemError::Interrupted));
        assert!(lock(&token.inner.parked).is_empty());
    }

    #[test]
    fn already_cancelled_token_fails_fast() {
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            WaitQueue::new().wait_event(&token, || false),
            Err(ModemError::Interrupted)
        );
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn timeout_wait_gives_up() {
        let wq = WaitQueue::new();
        assert!(!wq.wait_event_timeout(Duration::from_millis(5), || false));
        assert!(wq.wait_event_timeout(Duration::from_millis(5), || true));
    }
}
