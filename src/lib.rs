#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

//! # gyre
//!
//! A cooperative single-threaded event loop paired with a pooled HTTP/1.x
//! client driven by it.
//!
//! - An [`EventLoop`](runtime::EventLoop) multiplexing timers, fd readiness
//!   and deferred callbacks, with thread-safe external scheduling
//! - [`Deferred`](runtime::Deferred) results with ordered continuations and
//!   [`LoopingCall`](runtime::LoopingCall) periodic tasks that chain on them
//! - A [`Client`] with per-origin connection pooling and keep-alive
//! - Plain bodies, forms, JSON, [multipart]
//! - Cookie jar, [redirect](Client) chains with history, basic and digest
//!   authentication
//! - `Expect: 100-continue`, chunked transfer, gzip/deflate decoding
//! - HTTP(S) proxies, with `CONNECT` tunneling for TLS targets
//!
//! ## Making a GET request
//!
//! Everything runs as callbacks on one loop; drive it until the response
//! deferred completes:
//!
//! ```no_run
//! use gyre::{runtime::EventLoop, Client};
//!
//! fn main() -> Result<(), gyre::Error> {
//!     let mut el = EventLoop::new()?;
//!     let client = Client::new(&el.handle())?;
//!
//!     let deferred = client
//!         .get("http://httpbin.org/get")
//!         .form(&[("bla", "foo")])
//!         .send();
//!     let response = el.run_until(&deferred)?;
//!
//!     println!("{}", response.decode_content()?);
//!     Ok(())
//! }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, reuse the `Client`;
//! keep-alive connection pooling makes follow-up requests to the same origin
//! much cheaper.
//!
//! ## Scheduling without HTTP
//!
//! The loop stands alone: [`call_soon`](runtime::LoopHandle::call_soon),
//! [`call_later`](runtime::LoopHandle::call_later) and
//! [`call_at`](runtime::LoopHandle::call_at) schedule plain callbacks,
//! [`run_in_executor`](runtime::LoopHandle::run_in_executor) pushes blocking
//! work onto a worker pool, and a [`RemoteHandle`](runtime::RemoteHandle)
//! schedules safely from other threads.

pub use http::header;
pub use http::{Method, StatusCode, Version};
pub use url::Url;

mod error;
mod into_url;
mod util;

pub use self::error::{Error, Result};
pub use self::into_url::IntoUrl;

pub use self::client::multipart;
pub use self::client::{Bench, Body, Client, ClientBuilder, PoolKey, Request, RequestBuilder, Response};
pub use self::proxy::Proxy;

mod client;
pub mod cookie;
mod dns;
mod proxy;
mod redirect;
pub mod runtime;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_clone::<Client>();
    assert_clone::<Response>();

    assert_send::<runtime::RemoteHandle>();
    assert_sync::<runtime::RemoteHandle>();
    assert_send::<runtime::Handle>();
}
