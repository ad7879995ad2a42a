//! DNS resolution.
//!
//! Resolution is the blocking `getaddrinfo` behind [`ToSocketAddrs`], pushed
//! onto the worker pool so the loop never stalls; the returned deferred
//! completes back on the loop thread.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use log::trace;

use crate::runtime::{Deferred, Executor, LoopHandle};
use crate::Error;

pub(crate) fn resolve(
    handle: &LoopHandle,
    executor: &dyn Executor,
    host: &str,
    port: u16,
) -> Deferred<Vec<SocketAddr>> {
    // Literal addresses skip the worker pool round-trip.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Deferred::resolved(vec![SocketAddr::new(ip, port)]);
    }

    let deferred: Deferred<Vec<SocketAddr>> = Deferred::new();
    let out = deferred.clone();

    let target = (host.to_owned(), port);
    let lookup = handle.run_in_executor(executor, move || {
        trace!("resolving {}:{}", target.0, target.1);
        target
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
            .map_err(|e| e.to_string())
    });

    let host = host.to_owned();
    lookup.add_done_callback(move |result| match result {
        Ok(Ok(addrs)) if !addrs.is_empty() => deferred.resolve(addrs.clone()),
        Ok(Ok(_)) => deferred.reject(Error::connect(format!("no addresses for {host}"))),
        Ok(Err(e)) => deferred.reject(Error::connect(format!("failed to resolve {host}: {e}"))),
        Err(e) => deferred.reject(Error::connect(e.to_string())),
    });

    out
}
