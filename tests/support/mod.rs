#![allow(dead_code)]

pub mod server;

use std::time::Duration;

use gyre::runtime::EventLoop;
use gyre::Client;

/// A quick-ticking loop plus a small-pool client bound to it.
pub fn setup() -> (EventLoop, Client) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut el = EventLoop::new().unwrap();
    el.set_poll_timeout(Duration::from_millis(20));
    let client = Client::builder()
        .pool_size(2)
        .build(&el.handle())
        .unwrap();
    (el, client)
}
