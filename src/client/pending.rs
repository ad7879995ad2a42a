//! The per-request protocol state machine.
//!
//! One [`Pending`] drives a request chain end to end:
//!
//! **Acquiring → Writing → (ExpectWait?) → ReadingHead → ReadingBody →
//! release → (auth retry | redirect | deliver)**
//!
//! Auth retries and redirects loop back to Acquiring with a rebuilt request;
//! the deferred handed to the caller resolves only at deliver (or rejects at
//! the first unrecoverable failure).

use std::cell::RefCell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use http::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, COOKIE, EXPECT,
    HOST, USER_AGENT, WWW_AUTHENTICATE,
};
use http::{StatusCode, Version};
use log::{debug, error, trace};
use url::Url;

use super::conn::Conn;
use super::pool::PoolKey;
use super::proto::{self, ResponseHead, ResponseParser};
use super::{ClientRef, Request, Response};
use crate::redirect;
use crate::runtime::{Deferred, Handle, LoopHandle, Readiness};
use crate::util::replace_headers;
use crate::Error;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Acquiring,
    Writing,
    ExpectWait,
    ReadingHead,
    ReadingBody,
    Done,
}

pub(super) struct Pending {
    client: Weak<ClientRef>,
    handle: LoopHandle,
    deferred: Deferred<Response>,
    request: Request,
    key: PoolKey,
    state: State,
    conn: Option<Conn>,
    write_buf: BytesMut,
    held_body: Option<Bytes>,
    sent_close: bool,
    parser: ResponseParser,
    head: Option<ResponseHead>,
    body: BytesMut,
    history: Vec<Response>,
    redirect_count: usize,
    auth_attempted: HashSet<String>,
    timeout_handle: Option<Handle>,
}

impl Pending {
    pub(super) fn submit(client: &Rc<ClientRef>, request: Request) -> Deferred<Response> {
        let deferred: Deferred<Response> = Deferred::new();

        let key = match client.key_for(request.url()) {
            Ok(key) => key,
            Err(e) => return Deferred::rejected(e),
        };

        let pending = Rc::new(RefCell::new(Pending {
            client: Rc::downgrade(client),
            handle: client.handle.clone(),
            deferred: deferred.clone(),
            request,
            key,
            state: State::Acquiring,
            conn: None,
            write_buf: BytesMut::new(),
            held_body: None,
            sent_close: false,
            parser: ResponseParser::new(),
            head: None,
            body: BytesMut::new(),
            history: Vec::new(),
            redirect_count: 0,
            auth_attempted: HashSet::new(),
            timeout_handle: None,
        }));

        // The total deadline spans the whole chain, connects included.
        let timeout = pending.borrow().request.timeout().or(client.config.timeout);
        if let Some(timeout) = timeout {
            let weak = Rc::downgrade(&pending);
            let handle = client.handle.call_later(timeout, move || {
                if let Some(pending) = weak.upgrade() {
                    Pending::on_timeout(&pending);
                }
            });
            pending.borrow_mut().timeout_handle = Some(handle);
        }

        Self::start_hop(&pending);
        deferred
    }

    /// Acquire a connection for the current request and run one exchange.
    fn start_hop(this: &Rc<RefCell<Pending>>) {
        let (client, key) = {
            let pending = this.borrow();
            (pending.client.clone(), pending.key.clone())
        };
        let Some(client) = client.upgrade() else {
            Self::fail(this, Error::request("client dropped"));
            return;
        };

        let strong = this.clone();
        client.pool(&key).acquire().add_done_callback(move |result| {
            match result {
                Ok(cell) => {
                    let conn = cell.borrow_mut().take();
                    let Some(conn) = conn else { return };
                    let done = strong.borrow().state == State::Done;
                    if done {
                        // Timed out while acquiring; the connection arrives
                        // unused and goes straight back.
                        let pending = strong.borrow();
                        if let Some(client) = pending.client.upgrade() {
                            client.pool(&pending.key).release(conn, true);
                        } else {
                            conn.close(&pending.handle);
                        }
                        return;
                    }
                    Pending::attach(&strong, conn);
                }
                Err(e) => Pending::fail(&strong, e.clone()),
            }
        });
    }

    /// Bind an acquired connection and serialize the request onto it.
    fn attach(this: &Rc<RefCell<Pending>>, conn: Conn) {
        let token = conn.token;
        {
            let mut pending = this.borrow_mut();
            pending.conn = Some(conn);
            pending.parser = ResponseParser::new();
            pending.head = None;
            pending.body = BytesMut::new();
        }

        let strong = this.clone();
        this.borrow()
            .handle
            .set_io_callback(token, move |readiness| Pending::on_io(&strong, readiness));

        // pre_request hooks may still mutate headers and body.
        {
            let mut pending = this.borrow_mut();
            let hooks = pending.request.pre_request.clone();
            for hook in hooks {
                if panic::catch_unwind(AssertUnwindSafe(|| hook(&mut pending.request))).is_err() {
                    error!("pre_request hook panicked; ignored");
                }
            }
        }

        if let Err(e) = Self::serialize_request(this) {
            Self::fail(this, e);
            return;
        }

        this.borrow_mut().state = State::Writing;
        Self::flush_write(this);
    }

    fn serialize_request(this: &Rc<RefCell<Pending>>) -> crate::Result<()> {
        let mut pending = this.borrow_mut();
        let client = pending
            .client
            .upgrade()
            .ok_or_else(|| Error::request("client dropped"))?;

        let url = pending.request.url().clone();
        let version = pending.request.version();
        let method = pending.request.method().clone();
        let body = pending.request.body_bytes();

        let mut headers = HeaderMap::new();
        replace_headers(&mut headers, client.config.default_headers.clone());
        replace_headers(&mut headers, pending.request.headers().clone());
        replace_headers(&mut headers, pending.request.unredirected_headers().clone());

        if let Some(host) = host_header(&url) {
            headers.entry(HOST).or_insert(host);
        }
        headers
            .entry(USER_AGENT)
            .or_insert(HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )));
        headers.entry(ACCEPT).or_insert(HeaderValue::from_static("*/*"));
        headers
            .entry(ACCEPT_ENCODING)
            .or_insert(HeaderValue::from_static("gzip, deflate"));
        let default_connection = if version == Version::HTTP_10 {
            HeaderValue::from_static("close")
        } else {
            HeaderValue::from_static("keep-alive")
        };
        headers.entry(CONNECTION).or_insert(default_connection);

        // Jar cookies first, per-request overlay winning on name clashes.
        let mut cookie_pairs = client.jar.borrow_mut().matching(&url);
        for (name, value) in pending.request.cookie_overlay() {
            cookie_pairs.retain(|(n, _)| n != name);
            cookie_pairs.push((name.clone(), value.clone()));
        }
        if !cookie_pairs.is_empty() {
            let joined = cookie_pairs
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&joined) {
                headers.insert(COOKIE, value);
            }
        }

        if !body.is_empty() {
            headers
                .entry(CONTENT_LENGTH)
                .or_insert_with(|| HeaderValue::from(body.len() as u64));
        }

        let expecting = pending.request.expect_continue()
            && !body.is_empty()
            && version == Version::HTTP_11;
        if expecting {
            headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        }

        pending.sent_close = proto::connection_has(&headers, "close");

        // Through a proxy, a plain-HTTP request line carries the absolute
        // URI; tunneled TLS uses the origin form on the upgraded socket.
        let target = if pending.key.proxy.is_some() && !pending.key.is_tls() {
            url.as_str().to_owned()
        } else {
            origin_form(&url)
        };

        let mut buf = BytesMut::with_capacity(512 + if expecting { 0 } else { body.len() });
        proto::encode_head(&mut buf, &method, &target, version, &headers);
        if expecting {
            pending.held_body = Some(body);
        } else if !body.is_empty() {
            buf.extend_from_slice(&body);
        }
        pending.write_buf = buf;
        trace!("{} {} on {}", method, target, pending.key);
        Ok(())
    }

    fn on_io(this: &Rc<RefCell<Pending>>, readiness: Readiness) {
        if this.borrow().state == State::Done {
            return;
        }
        if readiness.writable {
            Self::flush_write(this);
        }
        if readiness.readable {
            Self::on_readable(this);
        }
    }

    fn flush_write(this: &Rc<RefCell<Pending>>) {
        let result = {
            let mut pending = this.borrow_mut();
            if pending.state != State::Writing {
                return;
            }
            let mut buf = std::mem::take(&mut pending.write_buf);
            let result = match pending.conn.as_mut() {
                Some(conn) => conn.write_some(&mut buf),
                None => return,
            };
            pending.write_buf = buf;
            result
        };

        if let Err(e) = result {
            Self::fail(this, Error::connect(e));
            return;
        }

        let flushed = this.borrow().write_buf.is_empty();
        if flushed {
            let mut pending = this.borrow_mut();
            pending.state = if pending.held_body.is_some() {
                State::ExpectWait
            } else {
                State::ReadingHead
            };
            drop(pending);
            // The response may already be buffered.
            Self::advance(this, false);
        }
    }

    fn on_readable(this: &Rc<RefCell<Pending>>) {
        let read = {
            let mut pending = this.borrow_mut();
            let Pending { conn, parser, .. } = &mut *pending;
            match conn.as_mut() {
                Some(conn) => conn.read_available(|chunk| parser.feed(chunk)),
                None => return,
            }
        };

        match read {
            Ok(eof) => Self::advance(this, eof),
            Err(e) => Self::fail(this, Error::connect(e)),
        }
    }

    /// Run the parser as far as the buffered bytes allow.
    fn advance(this: &Rc<RefCell<Pending>>, eof: bool) {
        loop {
            let state = this.borrow().state;
            match state {
                State::ExpectWait | State::ReadingHead => {
                    let head = match this.borrow_mut().parser.parse_head() {
                        Ok(head) => head,
                        Err(e) => return Self::fail(this, e),
                    };
                    let Some(head) = head else {
                        if eof {
                            let err = this.borrow_mut().parser.finish_eof().unwrap_err();
                            return Self::fail(this, err);
                        }
                        return;
                    };

                    if head.status == StatusCode::CONTINUE {
                        let mut pending = this.borrow_mut();
                        pending.parser.reset();
                        if let Some(body) = pending.held_body.take() {
                            trace!("100 Continue received, sending body");
                            pending.write_buf.extend_from_slice(&body);
                            pending.state = State::Writing;
                            drop(pending);
                            Self::flush_write(this);
                            return;
                        }
                        // Unsolicited interim response; keep reading.
                        continue;
                    }
                    if head.status.is_informational() {
                        this.borrow_mut().parser.reset();
                        continue;
                    }

                    Self::on_head(this, head);
                }
                State::ReadingBody => {
                    let decoded = this.borrow_mut().parser.decode_body();
                    let (data, done) = match decoded {
                        Ok(progress) => progress,
                        Err(e) => return Self::fail(this, e),
                    };
                    if !data.is_empty() {
                        let mut pending = this.borrow_mut();
                        let hooks = pending.request.on_data.clone();
                        for hook in &hooks {
                            if panic::catch_unwind(AssertUnwindSafe(|| hook(&data))).is_err() {
                                error!("on_data hook panicked; ignored");
                            }
                        }
                        if !pending.request.stream_enabled() {
                            pending.body.extend_from_slice(&data);
                        }
                    }
                    if done {
                        return Self::complete_exchange(this, false);
                    }
                    if eof {
                        let finished = this.borrow_mut().parser.finish_eof();
                        return match finished {
                            Ok(()) => Self::complete_exchange(this, true),
                            Err(e) => Self::fail(this, e),
                        };
                    }
                    return;
                }
                State::Writing => {
                    // Headers may arrive while the body is still flushing
                    // (e.g. an early error response); wait for the write side.
                    return;
                }
                State::Acquiring | State::Done => return,
            }
        }
    }

    /// Headers complete: run hooks, pick the body framing.
    fn on_head(this: &Rc<RefCell<Pending>>, head: ResponseHead) {
        {
            let mut pending = this.borrow_mut();
            // A terminal status while we held the body back means the server
            // refused the expectation; the body is never transmitted.
            if pending.held_body.take().is_some() {
                debug!("expectation refused with {}; body withheld", head.status);
            }

            let hooks = pending.request.on_headers.clone();
            for hook in &hooks {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    hook(head.status, &head.headers)
                }));
                if result.is_err() {
                    error!("on_headers hook panicked; response continues");
                }
            }

            let framing =
                match proto::body_framing(pending.request.method(), head.status, &head.headers) {
                    Ok(framing) => framing,
                    Err(e) => {
                        drop(pending);
                        return Self::fail(this, e);
                    }
                };
            pending.parser.begin_body(framing);
            pending.head = Some(head);
            pending.state = State::ReadingBody;
        }
        // Zero-length bodies complete without further reads.
        Self::advance(this, false);
    }

    /// Body complete: release the connection and decide the next step.
    fn complete_exchange(this: &Rc<RefCell<Pending>>, eof_delimited: bool) {
        let mut pending = this.borrow_mut();
        let Some(client) = pending.client.upgrade() else {
            drop(pending);
            return Self::fail(this, Error::request("client dropped"));
        };

        let head = pending.head.take().expect("exchange completed without head");
        let mut conn = pending.conn.take().expect("exchange completed without conn");
        conn.processed += 1;
        client
            .requests_processed
            .set(client.requests_processed.get() + 1);

        let processed = conn.processed;
        let remote_addr: Option<SocketAddr> = conn.remote_addr();

        let reusable = !eof_delimited
            && !pending.sent_close
            && proto::keep_alive(head.version, &head.headers);
        client.pool(&pending.key).release(conn, reusable);

        let url = pending.request.url().clone();
        if pending.request.store_cookies_enabled() && client.config.store_cookies {
            client
                .jar
                .borrow_mut()
                .set_cookies(head.headers.get_all(http::header::SET_COOKIE).iter(), &url);
        }

        let body = std::mem::take(&mut pending.body).freeze();
        let response = Response::new(
            head.status,
            head.version,
            head.reason.clone(),
            head.headers.clone(),
            url.clone(),
            body,
            pending.history.clone(),
            processed,
            remote_addr,
        );

        // 401 with configured credentials: retry once per origin.
        if head.status == StatusCode::UNAUTHORIZED {
            let netloc = pending.key.to_string();
            if !pending.auth_attempted.contains(&netloc) {
                if let Some(authorization) = Self::answer_challenge(&client, &pending, &head) {
                    trace!("retrying {netloc} with credentials");
                    pending.auth_attempted.insert(netloc);
                    pending.history.push(response);
                    pending
                        .request
                        .unredirected_headers_mut()
                        .insert(http::header::AUTHORIZATION, authorization);
                    pending.state = State::Acquiring;
                    drop(pending);
                    return Self::start_hop(this);
                }
            }
        }

        let max_redirects = pending
            .request
            .max_redirects()
            .unwrap_or(client.config.max_redirects);
        match redirect::check(
            head.status,
            pending.request.method(),
            &head.headers,
            &url,
            pending.redirect_count,
            max_redirects,
        ) {
            redirect::Action::Follow {
                url: next_url,
                method,
                keep_body,
            } => {
                trace!("following redirect to {next_url}");
                pending.redirect_count += 1;
                pending.history.push(response);

                let mut next = pending.request.redirected(method, next_url.clone(), keep_body);
                redirect::remove_sensitive_headers(next.headers_mut(), &next_url, &url);
                match client.key_for(next.url()) {
                    Ok(key) => pending.key = key,
                    Err(e) => {
                        drop(pending);
                        return Self::fail(this, e);
                    }
                }
                pending.request = next;
                pending.state = State::Acquiring;
                drop(pending);
                Self::start_hop(this);
            }
            redirect::Action::LimitReached => {
                drop(pending);
                Self::fail(this, Error::too_many_redirects(url, response));
            }
            redirect::Action::None => {
                pending.state = State::Done;
                if let Some(timer) = pending.timeout_handle.take() {
                    timer.cancel();
                }
                let deferred = pending.deferred.clone();
                drop(pending);
                deferred.resolve(response);
            }
        }
    }

    fn answer_challenge(
        client: &Rc<ClientRef>,
        pending: &Pending,
        head: &ResponseHead,
    ) -> Option<HeaderValue> {
        let credentials = client.credentials.borrow();
        let credentials = credentials.as_ref()?;
        let challenge = head.headers.get(WWW_AUTHENTICATE)?.to_str().ok()?;
        let uri = origin_form(pending.request.url());
        credentials.answer(challenge, pending.request.method().as_str(), &uri)
    }

    fn fail(this: &Rc<RefCell<Pending>>, error: Error) {
        let mut pending = this.borrow_mut();
        if pending.state == State::Done {
            return;
        }
        pending.state = State::Done;
        if let Some(timer) = pending.timeout_handle.take() {
            timer.cancel();
        }
        if let Some(conn) = pending.conn.take() {
            if let Some(client) = pending.client.upgrade() {
                client.pool(&pending.key).release(conn, false);
            } else {
                conn.close(&pending.handle);
            }
        }
        let deferred = pending.deferred.clone();
        drop(pending);
        deferred.reject(error);
    }

    fn on_timeout(this: &Rc<RefCell<Pending>>) {
        if this.borrow().state == State::Done {
            return;
        }
        debug!("request deadline hit; closing in-flight connection");
        Self::fail(this, Error::timeout());
    }
}

fn host_header(url: &Url) -> Option<HeaderValue> {
    let host = url.host_str()?;
    let authority = match (url.port(), url.scheme()) {
        (Some(port), _) => format!("{host}:{port}"),
        (None, _) => host.to_owned(),
    };
    HeaderValue::from_str(&authority).ok()
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_owned(),
    }
}
