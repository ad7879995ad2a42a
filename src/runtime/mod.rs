//! The cooperative event loop.
//!
//! A single-threaded scheduler multiplexing timers, file-descriptor readiness
//! and deferred callbacks. One [`EventLoop`] owns one thread; everything the
//! HTTP client does runs as callbacks on it.
//!
//! Scheduling from the loop thread goes through [`LoopHandle`] and is
//! lock-free; other threads use a [`RemoteHandle`], which takes a lock and
//! wakes the poller. Asynchronous results are [`Deferred`] cells, and
//! periodic work chains through [`LoopingCall`].

mod deferred;
mod event_loop;
mod executor;
mod handle;
mod looping;
mod poller;
mod time;

pub use self::deferred::Deferred;
pub use self::event_loop::{EventLoop, IoToken, LoopHandle, RemoteHandle};
pub use self::executor::Executor;
pub use self::handle::Handle;
pub use self::looping::LoopingCall;
pub use self::poller::Readiness;
pub use self::time::Clock;

pub(crate) use self::executor::default_pool;
