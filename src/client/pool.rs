//! Per-origin connection pooling.
//!
//! One [`Pool`] per origin key. Idle connections stack LIFO so the warmest
//! socket is reused first; saturated acquisitions queue FIFO. A freshly
//! dialled connection goes straight to the acquiring caller and never touches
//! the idle stack.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::trace;

use super::conn::{cell, Conn, ConnCell};
use crate::runtime::{Deferred, LoopHandle};
use crate::Error;

/// Pool partitioning identity: scheme, host, port, and proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub(crate) scheme: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) proxy: Option<(String, u16)>,
}

impl PoolKey {
    pub(crate) fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some((host, port)) = &self.proxy {
            write!(f, " via {host}:{port}")?;
        }
        Ok(())
    }
}

type DialFn = Rc<dyn Fn() -> Deferred<ConnCell>>;

struct PoolInner {
    key: PoolKey,
    handle: LoopHandle,
    pool_size: usize,
    keep_alive: Duration,
    available: Vec<Conn>,
    in_use: usize,
    waiters: VecDeque<Deferred<ConnCell>>,
    closed: bool,
    dial: DialFn,
}

/// A pool of reusable transport connections for one origin.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Rc<RefCell<PoolInner>>,
}

enum PumpAction {
    HandIdle(Conn, Deferred<ConnCell>),
    Dial(Deferred<ConnCell>),
    CloseDead(Conn),
    Done,
}

impl Pool {
    pub(crate) fn new(
        handle: LoopHandle,
        key: PoolKey,
        pool_size: usize,
        keep_alive: Duration,
        dial: DialFn,
    ) -> Pool {
        Pool {
            inner: Rc::new(RefCell::new(PoolInner {
                key,
                handle,
                pool_size: pool_size.max(1),
                keep_alive,
                available: Vec::new(),
                in_use: 0,
                waiters: VecDeque::new(),
                closed: false,
                dial,
            })),
        }
    }

    /// Check a connection out of the pool.
    ///
    /// Resolves immediately from the idle stack when possible, dials when
    /// below capacity, and otherwise queues behind earlier acquisitions.
    pub(crate) fn acquire(&self) -> Deferred<ConnCell> {
        let handle = self.handle();
        loop {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Deferred::rejected(Error::pool_closed());
            }

            if let Some(mut conn) = inner.available.pop() {
                if conn.is_usable(inner.keep_alive) {
                    inner.in_use += 1;
                    conn.idle_at = None;
                    trace!("{}: reusing idle connection", inner.key);
                    return Deferred::resolved(cell(conn));
                }
                trace!("{}: discarding stale idle connection", inner.key);
                drop(inner);
                conn.close(&handle);
                continue;
            }

            if inner.in_use < inner.pool_size {
                inner.in_use += 1;
                trace!("{}: dialing new connection", inner.key);
                drop(inner);
                let target = Deferred::new();
                self.spawn_dial(target.clone());
                return target;
            }

            let waiter = Deferred::new();
            inner.waiters.push_back(waiter.clone());
            trace!("{}: saturated, queueing waiter", inner.key);
            return waiter;
        }
    }

    /// Check a connection back in.
    ///
    /// Reusable connections park on the idle stack (up to capacity) with
    /// their idle deadline stamped; anything else is closed. Either way, a
    /// queued waiter gets a shot at the freed capacity.
    pub(crate) fn release(&self, mut conn: Conn, reusable: bool) {
        let handle = self.handle();
        let park = {
            let mut inner = self.inner.borrow_mut();
            inner.in_use = inner.in_use.saturating_sub(1);
            !inner.closed && reusable && inner.available.len() < inner.pool_size
        };
        if park {
            conn.idle_at = Some(Instant::now());
            self.watch_idle(&conn);
            let mut inner = self.inner.borrow_mut();
            trace!("{}: parking connection as idle", inner.key);
            inner.available.push(conn);
        } else {
            conn.close(&handle);
        }
        self.pump();
    }

    /// Fail all waiters and close every connection.
    pub(crate) fn close_all(&self) {
        let handle = self.handle();
        let (conns, waiters) = {
            let mut inner = self.inner.borrow_mut();
            inner.closed = true;
            (
                std::mem::take(&mut inner.available),
                std::mem::take(&mut inner.waiters),
            )
        };
        for conn in conns {
            conn.close(&handle);
        }
        for waiter in waiters {
            waiter.reject(Error::pool_closed());
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.inner.borrow().available.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.inner.borrow().in_use
    }

    fn handle(&self) -> LoopHandle {
        self.inner.borrow().handle.clone()
    }

    /// Hand queued waiters whatever capacity exists: idle sockets first,
    /// fresh dials when below capacity.
    fn pump(&self) {
        loop {
            let action = {
                let mut inner = self.inner.borrow_mut();
                if inner.closed || inner.waiters.is_empty() {
                    PumpAction::Done
                } else if let Some(conn) = inner.available.pop() {
                    if conn.is_usable(inner.keep_alive) {
                        let waiter = inner.waiters.pop_front().expect("waiters non-empty");
                        inner.in_use += 1;
                        PumpAction::HandIdle(conn, waiter)
                    } else {
                        PumpAction::CloseDead(conn)
                    }
                } else if inner.in_use < inner.pool_size {
                    let waiter = inner.waiters.pop_front().expect("waiters non-empty");
                    inner.in_use += 1;
                    PumpAction::Dial(waiter)
                } else {
                    PumpAction::Done
                }
            };

            match action {
                PumpAction::Done => return,
                PumpAction::CloseDead(conn) => conn.close(&self.handle()),
                PumpAction::HandIdle(mut conn, waiter) => {
                    conn.idle_at = None;
                    waiter.resolve(cell(conn));
                }
                PumpAction::Dial(waiter) => self.spawn_dial(waiter),
            }
        }
    }

    fn spawn_dial(&self, target: Deferred<ConnCell>) {
        let dial = self.inner.borrow().dial.clone();
        let pool = self.clone();
        (*dial)().add_done_callback(move |result| match result {
            Ok(conn) => target.resolve(conn.clone()),
            Err(e) => {
                // Only this acquisition fails; freed capacity lets the next
                // waiter retry.
                {
                    let mut inner = pool.inner.borrow_mut();
                    inner.in_use = inner.in_use.saturating_sub(1);
                }
                target.reject(e.clone());
                pool.pump();
            }
        });
    }

    /// While parked, a readable event means the peer closed (or broke
    /// protocol); drop the connection from the idle stack right away.
    fn watch_idle(&self, conn: &Conn) {
        let token = conn.token;
        let weak = Rc::downgrade(&self.inner);
        let handle = self.handle();
        handle.clone().set_io_callback(token, move |_readiness| {
            if let Some(inner) = weak.upgrade() {
                let conn = {
                    let mut inner = inner.borrow_mut();
                    inner
                        .available
                        .iter()
                        .position(|c| c.token == token)
                        .map(|i| inner.available.remove(i))
                };
                if let Some(conn) = conn {
                    trace!("idle connection closed by peer");
                    conn.close(&handle);
                }
            }
        });
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Pool")
            .field("key", &inner.key)
            .field("available", &inner.available.len())
            .field("in_use", &inner.in_use)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;

    fn pending_dial() -> (DialFn, Rc<RefCell<Vec<Deferred<ConnCell>>>>) {
        let dials: Rc<RefCell<Vec<Deferred<ConnCell>>>> = Rc::new(RefCell::new(Vec::new()));
        let record = dials.clone();
        let dial: DialFn = Rc::new(move || {
            let d = Deferred::new();
            record.borrow_mut().push(d.clone());
            d
        });
        (dial, dials)
    }

    fn key() -> PoolKey {
        PoolKey {
            scheme: "http".into(),
            host: "example.com".into(),
            port: 80,
            proxy: None,
        }
    }

    #[test]
    fn saturated_pool_queues_waiters_fifo() {
        let el = EventLoop::new().unwrap();
        let (dial, dials) = pending_dial();
        let pool = Pool::new(el.handle(), key(), 1, Duration::from_secs(15), dial);

        let first = pool.acquire();
        assert_eq!(dials.borrow().len(), 1);
        assert!(!first.is_done());
        assert_eq!(pool.in_use(), 1);

        // Capacity exhausted: these two queue instead of dialing.
        let _second = pool.acquire();
        let _third = pool.acquire();
        assert_eq!(dials.borrow().len(), 1);
    }

    #[test]
    fn dial_failure_fails_only_head_acquisition() {
        let el = EventLoop::new().unwrap();
        let (dial, dials) = pending_dial();
        let pool = Pool::new(el.handle(), key(), 1, Duration::from_secs(15), dial);

        let first = pool.acquire();
        let second = pool.acquire();

        // First dial fails; the waiter gets a fresh dial rather than the
        // error.
        dials.borrow()[0].reject(Error::connect("refused"));
        assert!(first.try_take().unwrap().is_err());
        assert!(!second.is_done());
        assert_eq!(dials.borrow().len(), 2);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn closed_pool_rejects_waiters_and_acquisitions() {
        let el = EventLoop::new().unwrap();
        let (dial, _dials) = pending_dial();
        let pool = Pool::new(el.handle(), key(), 1, Duration::from_secs(15), dial);

        let _first = pool.acquire();
        let waiter = pool.acquire();
        pool.close_all();

        assert!(waiter.try_take().unwrap().unwrap_err().is_pool_closed());
        assert!(pool.acquire().try_take().unwrap().unwrap_err().is_pool_closed());
    }
}
