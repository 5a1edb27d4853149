use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A FIFO asynchronous mutex.
///
/// `acquire()` resolves immediately when the lock is free, otherwise the
/// caller is queued and woken in arrival order. Dropping the returned
/// [`AsyncLockGuard`] releases the lock; if waiters are queued, the lock is
/// handed directly to the head waiter and stays held on its behalf.
#[derive(Default)]
pub struct AsyncLock {
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

struct Waiter {
    slot: Mutex<WaiterSlot>,
}

struct WaiterSlot {
    granted: bool,
    waker: Option<Waker>,
}

/// Release capability for an [`AsyncLock`]; releases on drop.
pub struct AsyncLockGuard<'a> {
    lock: &'a AsyncLock,
}

/// Future returned by [`AsyncLock::acquire`].
pub struct Acquire<'a> {
    lock: &'a AsyncLock,
    waiter: Option<Arc<Waiter>>,
    acquired: bool,
}

impl AsyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock can be taken by this caller.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            lock: self,
            waiter: None,
            acquired: false,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().expect("lock state poisoned")
    }

    // Waiter slots are only touched while the state mutex is held, which
    // keeps grant/cancel transitions atomic.
    fn release_locked(state: &mut LockState) {
        if let Some(waiter) = state.waiters.pop_front() {
            let mut slot = waiter.slot.lock().expect("waiter slot poisoned");
            slot.granted = true;
            if let Some(waker) = slot.waker.take() {
                waker.wake();
            }
        } else {
            state.locked = false;
        }
    }
}

impl Drop for AsyncLockGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state();
        AsyncLock::release_locked(&mut state);
    }
}

impl<'a> Future for Acquire<'a> {
    type Output = AsyncLockGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.lock.state();

        let Some(waiter) = this.waiter.clone() else {
            if !state.locked {
                state.locked = true;
                this.acquired = true;
                return Poll::Ready(AsyncLockGuard { lock: this.lock });
            }
            let waiter = Arc::new(Waiter {
                slot: Mutex::new(WaiterSlot {
                    granted: false,
                    waker: Some(cx.waker().clone()),
                }),
            });
            state.waiters.push_back(waiter.clone());
            this.waiter = Some(waiter);
            return Poll::Pending;
        };

        let mut slot = waiter.slot.lock().expect("waiter slot poisoned");
        if slot.granted {
            drop(slot);
            this.acquired = true;
            Poll::Ready(AsyncLockGuard { lock: this.lock })
        } else {
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(waiter) = &self.waiter else {
            return;
        };
        let mut state = self.lock.state();
        if let Some(at) = state
            .waiters
            .iter()
            .position(|queued| Arc::ptr_eq(queued, waiter))
        {
            state.waiters.remove(at);
        } else {
            // Already popped by a releaser: the lock was handed to this
            // abandoned waiter, so pass it along.
            let granted = waiter.slot.lock().expect("waiter slot poisoned").granted;
            if granted {
                AsyncLock::release_locked(&mut state);
            }
        }
    }
}
