use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use log::{debug, error};

use crate::Error;

type Callback<T> = Box<dyn FnOnce(&crate::Result<T>)>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Rc<crate::Result<T>>),
    Taken,
}

/// A single-assignment result cell with ordered continuations.
///
/// A `Deferred` is completed at most once, with either a value or an error.
/// Continuations registered with [`add_done_callback`](Deferred::add_done_callback)
/// run exactly once, in registration order; a continuation registered after
/// completion runs synchronously.
///
/// Deferreds are loop-local: they are `Rc`-shared and not `Send`. Work that
/// finishes on another thread reaches its deferred through
/// [`run_in_executor`](crate::runtime::LoopHandle::run_in_executor), which
/// completes it back on the loop thread.
pub struct Deferred<T> {
    inner: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Deferred<T> {
    /// A pending deferred.
    pub fn new() -> Deferred<T> {
        Deferred {
            inner: Rc::new(RefCell::new(State::Pending(Vec::new()))),
        }
    }

    /// A deferred already resolved with `value`.
    pub fn resolved(value: T) -> Deferred<T> {
        let d = Deferred::new();
        d.resolve(value);
        d
    }

    /// A deferred already rejected with `error`.
    pub fn rejected(error: Error) -> Deferred<T> {
        let d = Deferred::new();
        d.reject(error);
        d
    }

    /// Complete with a value.
    pub fn resolve(&self, value: T) {
        self.complete(Ok(value));
    }

    /// Complete with an error.
    pub fn reject(&self, error: Error) {
        self.complete(Err(error));
    }

    /// Complete the cell, running all registered continuations in order.
    ///
    /// Completing more than once is a logged error; the second result is
    /// dropped.
    pub fn complete(&self, result: crate::Result<T>) {
        let callbacks = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                State::Pending(callbacks) => {
                    let callbacks = mem::take(callbacks);
                    *state = State::Done(Rc::new(result));
                    callbacks
                }
                _ => {
                    error!("deferred completed more than once; result dropped");
                    return;
                }
            }
        };

        let shared = match &*self.inner.borrow() {
            State::Done(shared) => shared.clone(),
            _ => return,
        };
        for callback in callbacks {
            callback(&shared);
        }
    }

    /// Register a continuation.
    ///
    /// Runs synchronously if the deferred is already complete.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&crate::Result<T>) + 'static,
    {
        let shared = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(shared) => shared.clone(),
                State::Taken => {
                    debug!("continuation registered on a consumed deferred; dropped");
                    return;
                }
            }
        };
        callback(&shared);
    }

    /// Whether the deferred has been completed (or consumed).
    pub fn is_done(&self) -> bool {
        !matches!(&*self.inner.borrow(), State::Pending(_))
    }

    /// Take ownership of the result of a completed deferred.
    ///
    /// Returns `None` while pending, or if another clone of the result is
    /// still being borrowed by a running continuation.
    pub fn try_take(&self) -> Option<crate::Result<T>> {
        let mut state = self.inner.borrow_mut();
        match mem::replace(&mut *state, State::Taken) {
            State::Done(shared) => match Rc::try_unwrap(shared) {
                Ok(result) => Some(result),
                Err(shared) => {
                    *state = State::Done(shared);
                    None
                }
            },
            other => {
                *state = other;
                None
            }
        }
    }

    /// A `Deferred<()>` completing when `self` does, keeping only the
    /// success/failure signal.
    pub fn signal(&self) -> Deferred<()> {
        let signal = Deferred::new();
        let out = signal.clone();
        self.add_done_callback(move |result| match result {
            Ok(_) => signal.resolve(()),
            Err(e) => signal.reject(Error::request(e.to_string())),
        });
        out
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Deferred::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match &*self.inner.borrow() {
            State::Pending(callbacks) => format!("pending ({} callbacks)", callbacks.len()),
            State::Done(_) => "done".to_owned(),
            State::Taken => "taken".to_owned(),
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}
