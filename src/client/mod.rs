//! The pooled HTTP/1.x client.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use http::header::HeaderMap;
use http::{Method, Version};
use log::debug;
use native_tls::TlsConnector;
use url::Url;

use crate::cookie::Jar;
use crate::into_url::IntoUrl;
use crate::proxy::Proxy;
use crate::runtime::{Deferred, Executor, LoopHandle};
use crate::Error;

pub mod multipart;

mod auth;
mod body;
mod conn;
mod decoder;
mod pending;
mod pool;
mod proto;
mod request;
mod response;

pub use self::body::Body;
pub use self::pool::PoolKey;
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;

use self::auth::Credentials;
use self::conn::{ConnCell, DialConfig};
use self::pending::Pending;
use self::pool::Pool;

/// Default capacity of each per-origin connection pool.
const DEFAULT_POOL_SIZE: usize = 2;
/// How long an idle connection stays reusable.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const DEFAULT_MAX_REDIRECTS: usize = 10;

pub(crate) struct Config {
    pub(crate) default_headers: HeaderMap,
    pub(crate) version: Version,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_redirects: usize,
    pub(crate) pool_size: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) proxies: Vec<Proxy>,
    pub(crate) store_cookies: bool,
    accept_invalid_certs: bool,
}

pub(crate) struct ClientRef {
    pub(crate) handle: LoopHandle,
    pub(crate) config: Config,
    pub(crate) pools: RefCell<HashMap<PoolKey, Pool>>,
    pub(crate) jar: RefCell<Jar>,
    pub(crate) credentials: RefCell<Option<Credentials>>,
    pub(crate) sessions: Cell<u64>,
    pub(crate) requests_processed: Cell<u64>,
    executor: Rc<dyn Executor>,
    connector: Rc<TlsConnector>,
}

/// An asynchronous HTTP client driven by an [`EventLoop`](crate::runtime::EventLoop).
///
/// The client holds per-origin connection pools, a cookie jar, optional
/// credentials and proxy configuration. It is cheap to clone (clones share
/// everything) and bound to the loop whose handle built it.
///
/// ```no_run
/// use gyre::{Client, runtime::EventLoop};
///
/// fn main() -> Result<(), gyre::Error> {
///     let mut el = EventLoop::new()?;
///     let client = Client::new(&el.handle())?;
///     let response = el.run_until(&client.get("http://httpbin.org/get").send())?;
///     assert!(response.status().is_success());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientRef>,
}

/// A builder to configure a [`Client`].
#[must_use]
pub struct ClientBuilder {
    config: Config,
    executor: Option<Rc<dyn Executor>>,
}

/// The result of [`Client::timeit`]: wall-clock time and every response.
#[derive(Debug)]
pub struct Bench {
    /// Wall-clock time from first send to last completion.
    pub taken: Duration,
    /// Every response, in completion order.
    pub result: Vec<Response>,
}

impl ClientBuilder {
    /// A builder with the default configuration.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                default_headers: HeaderMap::new(),
                version: Version::HTTP_11,
                timeout: None,
                max_redirects: DEFAULT_MAX_REDIRECTS,
                pool_size: DEFAULT_POOL_SIZE,
                keep_alive: DEFAULT_KEEP_ALIVE,
                proxies: Vec::new(),
                store_cookies: true,
                accept_invalid_certs: false,
            },
            executor: None,
        }
    }

    /// Headers sent on every request unless overridden per request.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        crate::util::replace_headers(&mut self.config.default_headers, headers);
        self
    }

    /// The HTTP version used when a request does not choose one.
    pub fn version(mut self, version: Version) -> ClientBuilder {
        self.config.version = version;
        self
    }

    /// Total deadline applied to every request (overridable per request).
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeout = Some(timeout);
        self
    }

    /// Default cap on redirect chains.
    pub fn max_redirects(mut self, max: usize) -> ClientBuilder {
        self.config.max_redirects = max;
        self
    }

    /// Connection pool capacity per origin.
    pub fn pool_size(mut self, size: usize) -> ClientBuilder {
        self.config.pool_size = size.max(1);
        self
    }

    /// How long an idle pooled connection stays eligible for reuse.
    pub fn keep_alive(mut self, keep_alive: Duration) -> ClientBuilder {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Route matching requests through `proxy`. May be called repeatedly;
    /// the first matching proxy wins.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.config.proxies.push(proxy);
        self
    }

    /// When disabled, `Set-Cookie` responses never touch the jar.
    pub fn store_cookies(mut self, enabled: bool) -> ClientBuilder {
        self.config.store_cookies = enabled;
        self
    }

    /// Skip TLS certificate verification.
    ///
    /// Intended for test servers with self-signed certificates; keep it off
    /// everywhere else.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> ClientBuilder {
        self.config.accept_invalid_certs = accept;
        self
    }

    /// The worker pool used for DNS and `run_in_executor` work.
    pub fn executor(mut self, executor: Rc<dyn Executor>) -> ClientBuilder {
        self.executor = Some(executor);
        self
    }

    /// Bind the configuration to a loop and build the client.
    pub fn build(self, handle: &LoopHandle) -> crate::Result<Client> {
        let executor: Rc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Rc::new(crate::runtime::default_pool()?),
        };

        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .build()
            .map_err(Error::tls)?;

        Ok(Client {
            inner: Rc::new(ClientRef {
                handle: handle.clone(),
                config: self.config,
                pools: RefCell::new(HashMap::new()),
                jar: RefCell::new(Jar::new()),
                credentials: RefCell::new(None),
                sessions: Cell::new(0),
                requests_processed: Cell::new(0),
                executor,
                connector: Rc::new(connector),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("pool_size", &self.config.pool_size)
            .field("max_redirects", &self.config.max_redirects)
            .finish()
    }
}

impl Client {
    /// A client with default configuration bound to `handle`'s loop.
    pub fn new(handle: &LoopHandle) -> crate::Result<Client> {
        ClientBuilder::new().build(handle)
    }

    /// A `ClientBuilder` to configure a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start building a request with `method` to `url`.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let request = url.into_url().map(|url| {
            let mut request = Request::new(method, url);
            *request.version_mut() = self.inner.config.version;
            request
        });
        RequestBuilder::new(self.clone(), request)
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Convenience method to make an `OPTIONS` request to a URL.
    pub fn options<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Execute a `Request`, returning a deferred [`Response`].
    pub fn execute(&self, request: Request) -> Deferred<Response> {
        Pending::submit(&self.inner, request)
    }

    /// Fire `count` identical requests concurrently; the deferred resolves
    /// with the wall-clock time and every response once all complete.
    pub fn timeit<U: IntoUrl>(&self, method: Method, count: usize, url: U) -> Deferred<Bench> {
        let out: Deferred<Bench> = Deferred::new();
        let url = match url.into_url() {
            Ok(url) => url,
            Err(e) => return Deferred::rejected(e),
        };

        if count == 0 {
            out.resolve(Bench {
                taken: Duration::ZERO,
                result: Vec::new(),
            });
            return out;
        }

        let started = self.inner.handle.time();
        let state: Rc<RefCell<(Vec<Response>, bool)>> =
            Rc::new(RefCell::new((Vec::with_capacity(count), false)));

        for _ in 0..count {
            let deferred = self.request(method.clone(), url.clone()).send();
            let state = state.clone();
            let out = out.clone();
            deferred.add_done_callback(move |result| {
                let mut state = state.borrow_mut();
                if state.1 {
                    return;
                }
                match result {
                    Ok(response) => {
                        state.0.push(response.clone());
                        if state.0.len() == count {
                            state.1 = true;
                            let bench = Bench {
                                taken: started.elapsed(),
                                result: std::mem::take(&mut state.0),
                            };
                            drop(state);
                            out.resolve(bench);
                        }
                    }
                    Err(e) => {
                        state.1 = true;
                        drop(state);
                        out.reject(e.clone());
                    }
                }
            });
        }

        out
    }

    /// Configure basic credentials replayed after a 401 challenge.
    pub fn add_basic_authentication<U, P>(&self, username: U, password: P)
    where
        U: Into<String>,
        P: Into<String>,
    {
        *self.inner.credentials.borrow_mut() = Some(Credentials::Basic {
            username: username.into(),
            password: password.into(),
        });
    }

    /// Configure digest credentials replayed after a 401 challenge.
    pub fn add_digest_authentication<U, P>(&self, username: U, password: P)
    where
        U: Into<String>,
        P: Into<String>,
    {
        *self.inner.credentials.borrow_mut() = Some(Credentials::Digest {
            username: username.into(),
            password: password.into(),
        });
    }

    /// Seed the jar with a cookie, as if set by a response from `url`.
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        self.inner.jar.borrow_mut().add_cookie_str(cookie, url);
    }

    /// Drop every cookie from the jar.
    pub fn clear_cookies(&self) {
        self.inner.jar.borrow_mut().clear();
    }

    /// Number of cookies currently stored.
    pub fn cookie_count(&self) -> usize {
        self.inner.jar.borrow().len()
    }

    /// Connections dialled over the client's lifetime.
    pub fn sessions(&self) -> u64 {
        self.inner.sessions.get()
    }

    /// Exchanges completed over the client's lifetime.
    pub fn requests_processed(&self) -> u64 {
        self.inner.requests_processed.get()
    }

    /// Number of per-origin pools created so far.
    pub fn pool_count(&self) -> usize {
        self.inner.pools.borrow().len()
    }

    /// Idle and checked-out connection counts for `url`'s origin.
    pub fn pool_stats<U: IntoUrl>(&self, url: U) -> Option<(usize, usize)> {
        let url = url.into_url().ok()?;
        let key = self.inner.key_for(&url).ok()?;
        let pools = self.inner.pools.borrow();
        let pool = pools.get(&key)?;
        Some((pool.available(), pool.in_use()))
    }

    /// Close every pool: waiters fail, idle connections are dropped.
    pub fn close(&self) {
        let pools: Vec<Pool> = self.inner.pools.borrow_mut().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close_all();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("pools", &self.inner.pools.borrow().len())
            .field("sessions", &self.inner.sessions.get())
            .field("requests_processed", &self.inner.requests_processed.get())
            .finish()
    }
}

impl ClientRef {
    /// The pool partition for `url`: scheme, host, port, plus the proxy that
    /// would carry it.
    pub(crate) fn key_for(&self, url: &Url) -> crate::Result<PoolKey> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?
            .to_ascii_lowercase();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        let proxy = self
            .proxy_for(url)
            .map(|scheme| (scheme.host.clone(), scheme.port));
        Ok(PoolKey {
            scheme: url.scheme().to_owned(),
            host,
            port,
            proxy,
        })
    }

    fn proxy_for(&self, url: &Url) -> Option<&crate::proxy::ProxyScheme> {
        self.config
            .proxies
            .iter()
            .find_map(|proxy| proxy.intercept(url))
    }

    /// The pool for `key`, created on first use with a dial closure bound to
    /// this client's resolver, TLS connector and session counter.
    pub(crate) fn pool(self: &Rc<Self>, key: &PoolKey) -> Pool {
        if let Some(pool) = self.pools.borrow().get(key) {
            return pool.clone();
        }

        debug!("creating pool for {key}");
        let proxy = match &key.proxy {
            Some(_) => Url::parse(&format!("{}://{}:{}/", key.scheme, key.host, key.port))
                .ok()
                .as_ref()
                .and_then(|url| self.proxy_for(url))
                .cloned(),
            None => None,
        };
        let dial_config = DialConfig {
            host: key.host.clone(),
            port: key.port,
            tls: key.is_tls(),
            proxy,
            connector: key.is_tls().then(|| self.connector.clone()),
        };

        let handle = self.handle.clone();
        let executor = self.executor.clone();
        let client = Rc::downgrade(self);
        let dial = Rc::new(move || -> Deferred<ConnCell> {
            let deferred = conn::dial(&handle, executor.as_ref(), dial_config.clone());
            let client = client.clone();
            deferred.add_done_callback(move |result| {
                if result.is_ok() {
                    if let Some(client) = client.upgrade() {
                        client.sessions.set(client.sessions.get() + 1);
                    }
                }
            });
            deferred
        });

        let pool = Pool::new(
            self.handle.clone(),
            key.clone(),
            self.config.pool_size,
            self.config.keep_alive,
            dial,
        );
        self.pools.borrow_mut().insert(key.clone(), pool.clone());
        pool
    }
}
