use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use log::error;

use super::deferred::Deferred;
use super::event_loop::LoopHandle;
use super::handle::Handle;

type LoopingFn = dyn FnMut() -> Option<Deferred<()>>;

struct Inner {
    handle: LoopHandle,
    interval: Duration,
    cancelled: bool,
    timer: Option<Handle>,
    callback: Rc<RefCell<LoopingFn>>,
}

/// A periodic task that respects asynchronous results.
///
/// The callback runs every `interval` (or on every tick, for a zero
/// interval). If it returns a [`Deferred`], rearming waits for the deferred:
/// success rearms, failure logs and cancels the chain. A panic in the
/// callback likewise logs and cancels.
///
/// Every rearm schedules a fresh [`Handle`]; after [`cancel`](LoopingCall::cancel)
/// no further rearm occurs, even if an in-flight deferred completes later.
pub struct LoopingCall {
    inner: Rc<RefCell<Inner>>,
}

impl LoopingCall {
    /// Start calling `callback` every `interval`.
    ///
    /// A zero interval reenters the ready queue instead of the timer heap,
    /// running the callback once per tick.
    pub fn new<F>(handle: &LoopHandle, interval: Duration, callback: F) -> LoopingCall
    where
        F: FnMut() -> Option<Deferred<()>> + 'static,
    {
        let inner = Rc::new(RefCell::new(Inner {
            handle: handle.clone(),
            interval,
            cancelled: false,
            timer: None,
            callback: Rc::new(RefCell::new(callback)),
        }));
        Self::rearm(&inner);
        LoopingCall { inner }
    }

    /// Stop the chain. The currently scheduled fire is cancelled too.
    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.cancelled = true;
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
    }

    /// Whether the chain has been cancelled (explicitly or by a failure).
    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    fn rearm(inner: &Rc<RefCell<Inner>>) {
        let (handle, interval) = {
            let inner = inner.borrow();
            if inner.cancelled {
                return;
            }
            (inner.handle.clone(), inner.interval)
        };

        let fire_inner = inner.clone();
        let fire = move || Self::fire(&fire_inner);
        let timer = if interval.is_zero() {
            handle.call_soon(fire)
        } else {
            handle.call_later(interval, fire)
        };
        inner.borrow_mut().timer = Some(timer);
    }

    fn fire(inner: &Rc<RefCell<Inner>>) {
        let callback = {
            let inner = inner.borrow();
            if inner.cancelled {
                return;
            }
            inner.callback.clone()
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| (&mut *callback.borrow_mut())()));
        match result {
            Err(_) => {
                error!("looping callback panicked; chain cancelled");
                inner.borrow_mut().cancelled = true;
            }
            Ok(Some(deferred)) => {
                // Rearm only once the asynchronous result lands.
                let chain = inner.clone();
                deferred.add_done_callback(move |result| match result {
                    Ok(_) => Self::rearm(&chain),
                    Err(e) => {
                        error!("looping callback failed: {e}; chain cancelled");
                        chain.borrow_mut().cancelled = true;
                    }
                });
            }
            Ok(None) => Self::rearm(inner),
        }
    }
}

impl fmt::Debug for LoopingCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("LoopingCall")
            .field("interval", &inner.interval)
            .field("cancelled", &inner.cancelled)
            .finish()
    }
}
