use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::event::Source;
use mio::{Interest, Registry, Token};

use super::deferred::Deferred;
use super::executor::Executor;
use super::handle::Handle;
use super::poller::{Poller, Readiness};
use super::time::{Clock, TimerHeap};
use crate::Error;

/// How long `select` blocks when nothing is ready and no timer is due sooner.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

type IoCallback = Rc<RefCell<dyn FnMut(Readiness)>>;

/// An I/O registration on the loop, used to reregister or deregister the
/// source later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoToken(pub(crate) Token);

struct ReadyEntry {
    handle: Handle,
    callback: Box<dyn FnOnce()>,
}

/// FIFO of callbacks to run on the current tick.
///
/// The loop snapshots the length at drain start and runs exactly that many
/// entries, so work scheduled by a running callback waits for the next tick.
struct ReadyQueue {
    entries: VecDeque<ReadyEntry>,
}

impl ReadyQueue {
    fn new() -> ReadyQueue {
        ReadyQueue {
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, handle: Handle, callback: Box<dyn FnOnce()>) {
        self.entries.push_back(ReadyEntry { handle, callback });
    }

    fn pop(&mut self) -> Option<ReadyEntry> {
        self.entries.pop_front()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct LoopState {
    ready: ReadyQueue,
    timers: TimerHeap,
    io: HashMap<Token, IoCallback>,
    registry: Registry,
    next_token: usize,
    parked: HashMap<u64, Box<dyn FnOnce()>>,
    next_parked: u64,
    clock: Clock,
    running: bool,
    stopping: bool,
    tid: Option<ThreadId>,
}

enum RemoteOp {
    Soon(Handle, Box<dyn FnOnce() + Send>),
    At(Instant, Handle, Box<dyn FnOnce() + Send>),
    Ping(u64),
    Stop,
}

struct Shared {
    queue: Mutex<Vec<RemoteOp>>,
    waker: mio::Waker,
}

impl Shared {
    fn push(&self, op: RemoteOp) {
        self.queue.lock().expect("loop queue poisoned").push(op);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake event loop: {e}");
        }
    }
}

/// A single-threaded cooperative scheduler multiplexing timers,
/// file-descriptor readiness and deferred callbacks.
///
/// The loop owns the thread it first runs on. Code on that thread schedules
/// through a cheap [`LoopHandle`]; other threads go through a
/// [`RemoteHandle`], which locks a queue and wakes the poller.
///
/// ```no_run
/// use gyre::runtime::EventLoop;
///
/// let mut el = EventLoop::new().unwrap();
/// let handle = el.handle();
/// handle.call_soon({
///     let handle = handle.clone();
///     move || handle.stop()
/// });
/// el.run_forever();
/// ```
pub struct EventLoop {
    state: Rc<RefCell<LoopState>>,
    shared: Arc<Shared>,
    poller: Poller,
    poll_timeout: Duration,
}

impl EventLoop {
    /// A fresh loop with its own poller and waker.
    pub fn new() -> crate::Result<EventLoop> {
        let (poller, registry, waker) = Poller::new().map_err(Error::runtime)?;
        Ok(EventLoop {
            state: Rc::new(RefCell::new(LoopState {
                ready: ReadyQueue::new(),
                timers: TimerHeap::new(),
                io: HashMap::new(),
                registry,
                next_token: 1,
                parked: HashMap::new(),
                next_parked: 0,
                clock: Clock::new(),
                running: false,
                stopping: false,
                tid: None,
            })),
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::new()),
                waker,
            }),
            poller,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        })
    }

    /// Change the default poll timeout used when the loop is otherwise idle.
    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    /// A handle for scheduling from the loop thread.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            state: self.state.clone(),
            shared: self.shared.clone(),
        }
    }

    /// A handle for scheduling from other threads.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            shared: self.shared.clone(),
        }
    }

    /// Whether a `run_*` call is currently driving ticks.
    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// The thread the loop last ran on, if any.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.state.borrow().tid
    }

    /// Request the loop to exit; the current tick finishes first.
    pub fn stop(&self) {
        self.state.borrow_mut().stopping = true;
    }

    /// Run ticks until [`stop`](EventLoop::stop) is requested.
    pub fn run_forever(&mut self) {
        self.run_while(|| true);
    }

    /// Run ticks until `deferred` completes (or the loop is stopped), then
    /// take its result.
    pub fn run_until<T: 'static>(&mut self, deferred: &Deferred<T>) -> crate::Result<T> {
        self.run_while(|| !deferred.is_done());
        deferred
            .try_take()
            .unwrap_or_else(|| Err(Error::runtime("event loop stopped before completion")))
    }

    fn run_while<F: Fn() -> bool>(&mut self, condition: F) {
        {
            let mut state = self.state.borrow_mut();
            state.running = true;
            state.tid = Some(thread::current().id());
        }
        while condition() && !self.state.borrow().stopping {
            self.tick();
        }
        let mut state = self.state.borrow_mut();
        state.running = false;
        state.stopping = false;
    }

    /// One scheduler pass: drain cross-thread work, fire due timers, poll for
    /// readiness, then run the ready queue.
    pub(crate) fn tick(&mut self) {
        self.drain_remote();

        let now = Instant::now();
        loop {
            let due = self.state.borrow_mut().timers.pop_due(now);
            match due {
                Some((handle, callback)) => {
                    self.state.borrow_mut().ready.push(handle, callback);
                }
                None => break,
            }
        }

        let timeout = {
            let mut state = self.state.borrow_mut();
            if !state.ready.is_empty() {
                Duration::ZERO
            } else {
                match state.timers.next_deadline() {
                    Some(when) => when.saturating_duration_since(now).min(self.poll_timeout),
                    None => self.poll_timeout,
                }
            }
        };

        match self.poller.select(Some(timeout)) {
            Ok(events) => {
                for (token, readiness) in events {
                    let callback = self.state.borrow().io.get(&token).cloned();
                    match callback {
                        Some(callback) => {
                            trace!("io ready on {token:?}: {readiness:?}");
                            self.state.borrow_mut().ready.push(
                                Handle::new(),
                                Box::new(move || {
                                    if let Ok(mut f) = callback.try_borrow_mut() {
                                        (&mut *f)(readiness);
                                    }
                                }),
                            );
                        }
                        None => debug!("readiness for unregistered {token:?} dropped"),
                    }
                }
            }
            Err(e) => error!("selector error: {e}"),
        }

        // A wake during select usually means new cross-thread work; pick it
        // up before draining so it runs this tick.
        self.drain_remote();

        let batch = self.state.borrow().ready.len();
        for _ in 0..batch {
            let entry = self.state.borrow_mut().ready.pop();
            let Some(entry) = entry else { break };
            if entry.handle.is_cancelled() {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry.callback)) {
                error!("callback panicked: {}", panic_message(&payload));
            }
        }
    }

    fn drain_remote(&mut self) {
        let ops = {
            let mut queue = self.shared.queue.lock().expect("loop queue poisoned");
            std::mem::take(&mut *queue)
        };
        if ops.is_empty() {
            return;
        }
        let mut state = self.state.borrow_mut();
        for op in ops {
            match op {
                RemoteOp::Soon(handle, callback) => state.ready.push(handle, callback),
                RemoteOp::At(when, handle, callback) => state.timers.push(when, handle, callback),
                RemoteOp::Ping(id) => {
                    if let Some(callback) = state.parked.remove(&id) {
                        state.ready.push(Handle::new(), callback);
                    }
                }
                RemoteOp::Stop => state.stopping = true,
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("EventLoop")
            .field("running", &state.running)
            .field("ready", &state.ready.len())
            .field("timers", &state.timers.len())
            .field("io", &state.io.len())
            .finish()
    }
}

/// Cheap, clonable scheduling handle for use on the loop thread.
///
/// Not `Send`; cross-thread scheduling goes through [`RemoteHandle`].
#[derive(Clone)]
pub struct LoopHandle {
    state: Rc<RefCell<LoopState>>,
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// The loop's monotonic clock.
    pub fn clock(&self) -> Clock {
        self.state.borrow().clock
    }

    /// Current monotonic time.
    pub fn time(&self) -> Instant {
        self.state.borrow().clock.now()
    }

    /// Schedule `callback` to run on the next tick.
    pub fn call_soon<F>(&self, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        let handle = Handle::new();
        self.state
            .borrow_mut()
            .ready
            .push(handle.clone(), Box::new(callback));
        handle
    }

    /// Schedule `callback` to run `delay` from now.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        self.call_at(self.time() + delay, callback)
    }

    /// Schedule `callback` to run at the absolute time `when`.
    pub fn call_at<F>(&self, when: Instant, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        let handle = Handle::new();
        self.state
            .borrow_mut()
            .timers
            .push(when, handle.clone(), Box::new(callback));
        handle
    }

    /// Request the loop to exit; the current tick finishes first.
    pub fn stop(&self) {
        self.state.borrow_mut().stopping = true;
    }

    /// A `Send + Sync` handle for scheduling onto this loop from other
    /// threads.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run blocking `work` on `executor`; the returned deferred completes on
    /// the loop thread once the worker finishes.
    pub fn run_in_executor<T, F>(&self, executor: &dyn Executor, work: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let deferred = Deferred::new();
        let slot: Arc<Mutex<Option<thread::Result<T>>>> = Arc::new(Mutex::new(None));

        let id = {
            let completion = {
                let deferred = deferred.clone();
                let slot = slot.clone();
                move || match slot.lock().expect("executor slot poisoned").take() {
                    Some(Ok(value)) => deferred.resolve(value),
                    Some(Err(payload)) => {
                        deferred.reject(Error::runtime(panic_message(&payload)))
                    }
                    None => deferred.reject(Error::runtime("executor job produced no result")),
                }
            };
            let mut state = self.state.borrow_mut();
            let id = state.next_parked;
            state.next_parked += 1;
            state.parked.insert(id, Box::new(completion));
            id
        };

        let remote = self.remote();
        executor.execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(work));
            *slot.lock().expect("executor slot poisoned") = Some(result);
            remote.ping(id);
        }));

        deferred
    }

    /// Register an I/O source; `callback` runs whenever readiness arrives.
    pub fn register<S, F>(
        &self,
        source: &mut S,
        interest: Interest,
        callback: F,
    ) -> crate::Result<IoToken>
    where
        S: Source + ?Sized,
        F: FnMut(Readiness) + 'static,
    {
        let mut state = self.state.borrow_mut();
        let token = Token(state.next_token);
        state.next_token += 1;
        state
            .registry
            .register(source, token, interest)
            .map_err(Error::runtime)?;
        state.io.insert(token, Rc::new(RefCell::new(callback)));
        Ok(IoToken(token))
    }

    /// Change the interest set of a registered source.
    pub fn reregister<S>(
        &self,
        source: &mut S,
        token: IoToken,
        interest: Interest,
    ) -> crate::Result<()>
    where
        S: Source + ?Sized,
    {
        self.state
            .borrow()
            .registry
            .reregister(source, token.0, interest)
            .map_err(Error::runtime)
    }

    /// Remove a source from the loop.
    pub fn deregister<S>(&self, source: &mut S, token: IoToken) -> crate::Result<()>
    where
        S: Source + ?Sized,
    {
        let mut state = self.state.borrow_mut();
        state.io.remove(&token.0);
        state.registry.deregister(source).map_err(Error::runtime)
    }

    /// Swap the readiness callback of an existing registration.
    pub(crate) fn set_io_callback<F>(&self, token: IoToken, callback: F)
    where
        F: FnMut(Readiness) + 'static,
    {
        self.state
            .borrow_mut()
            .io
            .insert(token.0, Rc::new(RefCell::new(callback)));
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopHandle").finish()
    }
}

/// Thread-safe scheduling onto an [`EventLoop`] from outside its thread.
///
/// Every call locks the remote queue, then wakes the poller so a blocked
/// `select` returns immediately.
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<Shared>,
}

impl RemoteHandle {
    /// Schedule `callback` onto the loop from any thread.
    pub fn call_soon_threadsafe<F>(&self, callback: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Handle::new();
        self.shared
            .push(RemoteOp::Soon(handle.clone(), Box::new(callback)));
        handle
    }

    /// Schedule `callback` at the absolute time `when` from any thread.
    pub fn call_at<F>(&self, when: Instant, callback: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Handle::new();
        self.shared
            .push(RemoteOp::At(when, handle.clone(), Box::new(callback)));
        handle
    }

    /// Schedule `callback` to run `delay` from now, from any thread.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_at(Instant::now() + delay, callback)
    }

    /// Request the loop to exit from any thread.
    pub fn stop(&self) {
        self.shared.push(RemoteOp::Stop);
    }

    pub(crate) fn ping(&self, id: u64) {
        self.shared.push(RemoteOp::Ping(id));
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteHandle").finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn quick_loop() -> EventLoop {
        let mut el = EventLoop::new().unwrap();
        el.set_poll_timeout(Duration::from_millis(10));
        el
    }

    #[test]
    fn call_soon_runs_in_fifo_order() {
        let mut el = quick_loop();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..4 {
            let log = log.clone();
            handle.call_soon(move || log.borrow_mut().push(i));
        }
        el.tick();
        assert_eq!(*log.borrow(), [0, 1, 2, 3]);
    }

    #[test]
    fn work_scheduled_during_tick_waits_for_next_tick() {
        let mut el = quick_loop();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            let inner_handle = handle.clone();
            handle.call_soon(move || {
                log.borrow_mut().push("first");
                let log = log.clone();
                inner_handle.call_soon(move || log.borrow_mut().push("second"));
            });
        }

        el.tick();
        assert_eq!(*log.borrow(), ["first"]);
        el.tick();
        assert_eq!(*log.borrow(), ["first", "second"]);
    }

    #[test]
    fn cancelled_callback_never_runs() {
        let mut el = quick_loop();
        let handle = el.handle();

        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let timer = handle.call_later(Duration::from_millis(1), move || {
            *flag.borrow_mut() = true;
        });
        timer.cancel();

        for _ in 0..5 {
            el.tick();
        }
        assert!(!*ran.borrow());
    }

    #[test]
    fn timers_fire_in_order() {
        let mut el = quick_loop();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        let now = handle.time();
        for (i, offset) in [(2u32, 20u64), (0, 5), (1, 10)] {
            let log = log.clone();
            handle.call_at(now + Duration::from_millis(offset), move || {
                log.borrow_mut().push(i)
            });
        }

        let done: Deferred<()> = Deferred::new();
        let d = done.clone();
        handle.call_later(Duration::from_millis(40), move || d.resolve(()));
        el.run_until(&done).unwrap();

        assert_eq!(*log.borrow(), [0, 1, 2]);
    }

    #[test]
    fn callback_panic_does_not_kill_the_loop() {
        let mut el = quick_loop();
        let handle = el.handle();

        handle.call_soon(|| panic!("boom"));
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        handle.call_soon(move || *flag.borrow_mut() = true);

        el.tick();
        assert!(*ran.borrow());
    }

    #[test]
    fn stop_is_sticky_for_the_run() {
        let mut el = quick_loop();
        let handle = el.handle();

        let ticks = Rc::new(RefCell::new(0u32));
        {
            let handle2 = handle.clone();
            let ticks = ticks.clone();
            handle.call_soon(move || {
                *ticks.borrow_mut() += 1;
                handle2.stop();
            });
        }
        el.run_forever();
        assert_eq!(*ticks.borrow(), 1);
    }

    #[test]
    fn cross_thread_scheduling_wakes_the_loop() {
        let mut el = quick_loop();
        // A long idle timeout: only the waker can make this finish promptly.
        el.set_poll_timeout(Duration::from_secs(5));
        let remote = el.remote();

        let value = Arc::new(Mutex::new(None));
        let thread_value = value.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.call_soon_threadsafe(move || {
                *thread_value.lock().unwrap() = Some(42);
            });
        });

        let started = Instant::now();
        while value.lock().unwrap().is_none() {
            assert!(started.elapsed() < Duration::from_secs(2), "waker never fired");
            el.tick();
        }
        t.join().unwrap();
        assert_eq!(*value.lock().unwrap(), Some(42));
    }

    #[test]
    fn run_in_executor_completes_on_the_loop() {
        let mut el = quick_loop();
        let handle = el.handle();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

        let deferred = handle.run_in_executor(&pool, || 6 * 7);
        let value = el.run_until(&deferred).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn run_in_executor_surfaces_worker_panic() {
        let mut el = quick_loop();
        let handle = el.handle();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

        let deferred: Deferred<u32> = handle.run_in_executor(&pool, || panic!("worker died"));
        let err = el.run_until(&deferred).unwrap_err();
        assert!(err.to_string().contains("worker died"));
    }
}
