use std::convert::TryFrom;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode, Version};
use serde::Serialize;
use url::Url;

use super::body::Body;
use super::multipart::{Form, Part};
use super::{Client, Response};
use crate::runtime::Deferred;
use crate::Error;

pub(crate) type PreRequestHook = Rc<dyn Fn(&mut Request)>;
pub(crate) type HeadersHook = Rc<dyn Fn(StatusCode, &HeaderMap)>;
pub(crate) type DataHook = Rc<dyn Fn(&[u8])>;

/// A request which can be executed with `Client::execute()`.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    unredirected_headers: HeaderMap,
    body: Option<Body>,
    version: Version,
    timeout: Option<Duration>,
    max_redirects: Option<usize>,
    expect_continue: bool,
    store_cookies: bool,
    stream: bool,
    cookies: Vec<(String, String)>,
    pub(crate) pre_request: Vec<PreRequestHook>,
    pub(crate) on_headers: Vec<HeadersHook>,
    pub(crate) on_data: Vec<DataHook>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            unredirected_headers: HeaderMap::new(),
            body: None,
            version: Version::HTTP_11,
            timeout: None,
            max_redirects: None,
            expect_continue: false,
            store_cookies: true,
            stream: false,
            cookies: Vec::new(),
            pre_request: Vec::new(),
            on_headers: Vec::new(),
            on_data: Vec::new(),
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Headers sent on this request but never carried onto redirects
    /// (credentials, per-origin state).
    #[inline]
    pub fn unredirected_headers(&self) -> &HeaderMap {
        &self.unredirected_headers
    }

    /// Get a mutable reference to the unredirected headers.
    #[inline]
    pub fn unredirected_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.unredirected_headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the HTTP version.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get a mutable reference to the HTTP version.
    #[inline]
    pub fn version_mut(&mut self) -> &mut Version {
        &mut self.version
    }

    /// Get the per-request deadline.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn max_redirects(&self) -> Option<usize> {
        self.max_redirects
    }

    pub(crate) fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub(crate) fn store_cookies_enabled(&self) -> bool {
        self.store_cookies
    }

    pub(crate) fn stream_enabled(&self) -> bool {
        self.stream
    }

    pub(crate) fn cookie_overlay(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub(crate) fn body_bytes(&self) -> Bytes {
        self.body
            .as_ref()
            .map(Body::clone_bytes)
            .unwrap_or_else(Bytes::new)
    }

    /// The follow-up request for a redirect: same knobs and hooks, new
    /// method/URL, unredirected headers dropped.
    pub(crate) fn redirected(&self, method: Method, url: Url, keep_body: bool) -> Request {
        let mut next = self.clone();
        next.method = method;
        next.url = url;
        next.unredirected_headers = HeaderMap::new();
        if !keep_body {
            next.body = None;
            next.headers.remove(CONTENT_TYPE);
            next.headers.remove(http::header::CONTENT_LENGTH);
        }
        next
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
    form_fields: Option<Vec<(String, String)>>,
    json_body: Option<Vec<u8>>,
    file_parts: Vec<(String, Part)>,
    multipart_form: Option<Form>,
    encode_multipart: bool,
}

impl RequestBuilder {
    pub(super) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder {
            client,
            request,
            form_fields: None,
            json_body: None,
            file_parts: Vec::new(),
            multipart_form: None,
            encode_multipart: true,
        }
    }

    /// Add a header to this request, replacing any existing value.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().insert(key, value);
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of headers to the existing ones on this request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            crate::util::replace_headers(req.headers_mut(), headers);
        }
        self
    }

    /// Enable HTTP basic authentication.
    ///
    /// The credential header is not carried across redirects.
    pub fn basic_auth<U, P>(mut self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        if let Ok(ref mut req) = self.request {
            let header = crate::util::basic_auth(username, password);
            req.unredirected_headers_mut().insert(AUTHORIZATION, header);
        }
        self
    }

    /// Enable HTTP bearer authentication.
    pub fn bearer_auth<T>(mut self, token: T) -> RequestBuilder
    where
        T: fmt::Display,
    {
        if let Ok(ref mut req) = self.request {
            match HeaderValue::try_from(format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    req.unredirected_headers_mut().insert(AUTHORIZATION, value);
                }
                Err(e) => self.request = Err(Error::builder(e)),
            }
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Modify the query string of the URL, appending serialized pairs.
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(query) {
                Ok(encoded) if !encoded.is_empty() => {
                    let url = req.url_mut();
                    let full = match url.query() {
                        Some(existing) if !existing.is_empty() => {
                            format!("{existing}&{encoded}")
                        }
                        _ => encoded,
                    };
                    url.set_query(Some(&full));
                }
                Ok(_) => {}
                Err(e) => error = Some(Error::builder(e)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Attach form data to this request.
    ///
    /// For GET and HEAD the pairs are appended to the query string; for other
    /// methods they become the body, `multipart/form-data` by default or
    /// `application/x-www-form-urlencoded` when multipart encoding is
    /// disabled with [`encode_multipart(false)`](RequestBuilder::encode_multipart).
    pub fn form<T: Serialize + ?Sized>(mut self, form: &T) -> RequestBuilder {
        match serde_urlencoded::to_string(form) {
            Ok(encoded) => {
                let pairs = url::form_urlencoded::parse(encoded.as_bytes())
                    .into_owned()
                    .collect();
                self.form_fields = Some(pairs);
            }
            Err(e) => self.request = Err(Error::builder(e)),
        }
        self
    }

    /// Send a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        match serde_json::to_vec(json) {
            Ok(body) => self.json_body = Some(body),
            Err(e) => self.request = Err(Error::builder(e)),
        }
        self
    }

    /// Attach a file field, forcing `multipart/form-data` encoding.
    pub fn file<N, F, B>(mut self, name: N, file_name: F, bytes: B) -> RequestBuilder
    where
        N: Into<String>,
        F: Into<std::borrow::Cow<'static, str>>,
        B: Into<Bytes>,
    {
        self.file_parts
            .push((name.into(), Part::bytes(bytes.into()).file_name(file_name)));
        self
    }

    /// Send a prebuilt multipart form as the body.
    pub fn multipart(mut self, form: Form) -> RequestBuilder {
        self.multipart_form = Some(form);
        self
    }

    /// Choose between multipart and urlencoded encoding for form data.
    pub fn encode_multipart(mut self, enabled: bool) -> RequestBuilder {
        self.encode_multipart = enabled;
        self
    }

    /// Add a cookie sent with this request only, overlaid on the client jar.
    pub fn cookie<N, V>(mut self, name: N, value: V) -> RequestBuilder
    where
        N: Into<String>,
        V: Into<String>,
    {
        if let Ok(ref mut req) = self.request {
            req.cookies.push((name.into(), value.into()));
        }
        self
    }

    /// Enables a total request timeout, overriding the client default.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.timeout = Some(timeout);
        }
        self
    }

    /// Cap the redirect chain for this request.
    pub fn max_redirects(mut self, max: usize) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.max_redirects = Some(max);
        }
        self
    }

    /// Set the HTTP version for this request.
    pub fn version(mut self, version: Version) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.version = version;
        }
        self
    }

    /// Send `Expect: 100-continue` and hold the body until the server
    /// answers.
    pub fn expect_continue(mut self, enabled: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.expect_continue = enabled;
        }
        self
    }

    /// When disabled, response `Set-Cookie` headers are not persisted into
    /// the client jar.
    pub fn store_cookies(mut self, enabled: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.store_cookies = enabled;
        }
        self
    }

    /// Deliver body data through `on_data` hooks as it decodes instead of
    /// buffering it on the response.
    pub fn stream(mut self, enabled: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.stream = enabled;
        }
        self
    }

    /// Run `hook` on the request just before its bytes are written.
    pub fn pre_request<F>(mut self, hook: F) -> RequestBuilder
    where
        F: Fn(&mut Request) + 'static,
    {
        if let Ok(ref mut req) = self.request {
            req.pre_request.push(Rc::new(hook));
        }
        self
    }

    /// Run `hook` once response headers are complete. Hook panics are logged
    /// and do not abort the exchange.
    pub fn on_headers<F>(mut self, hook: F) -> RequestBuilder
    where
        F: Fn(StatusCode, &HeaderMap) + 'static,
    {
        if let Ok(ref mut req) = self.request {
            req.on_headers.push(Rc::new(hook));
        }
        self
    }

    /// Run `hook` for each chunk of decoded body data.
    pub fn on_data<F>(mut self, hook: F) -> RequestBuilder
    where
        F: Fn(&[u8]) + 'static,
    {
        if let Ok(ref mut req) = self.request {
            req.on_data.push(Rc::new(hook));
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    pub fn build(self) -> crate::Result<Request> {
        let RequestBuilder {
            request,
            form_fields,
            json_body,
            file_parts,
            multipart_form,
            encode_multipart,
            ..
        } = self;
        let mut request = request?;

        if let Some(form) = multipart_form {
            set_body(&mut request, form.content_type(), form.encode());
        } else if !file_parts.is_empty() && encode_multipart {
            let mut form = Form::new();
            for (name, value) in form_fields.unwrap_or_default() {
                form = form.text(name, value);
            }
            for (name, part) in file_parts {
                form = form.part(name, part);
            }
            set_body(&mut request, form.content_type(), form.encode());
        } else if let Some(fields) = form_fields {
            if *request.method() == Method::GET || *request.method() == Method::HEAD {
                merge_query(&mut request, &fields);
            } else if encode_multipart {
                let mut form = Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                set_body(&mut request, form.content_type(), form.encode());
            } else {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields)
                    .finish();
                set_body(
                    &mut request,
                    "application/x-www-form-urlencoded".to_owned(),
                    encoded.into_bytes().into(),
                );
            }
        } else if let Some(json) = json_body {
            set_body(&mut request, "application/json".to_owned(), json.into());
        }

        Ok(request)
    }

    /// Constructs the request and sends it to the target URL, returning a
    /// deferred response.
    pub fn send(self) -> Deferred<Response> {
        let client = self.client.clone();
        match self.build() {
            Ok(request) => client.execute(request),
            Err(e) => Deferred::rejected(e),
        }
    }
}

fn set_body(request: &mut Request, content_type: String, bytes: Bytes) {
    if let Ok(value) = HeaderValue::try_from(content_type) {
        request.headers_mut().entry(CONTENT_TYPE).or_insert(value);
    }
    *request.body_mut() = Some(Body::from(bytes));
}

fn merge_query(request: &mut Request, fields: &[(String, String)]) {
    if fields.is_empty() {
        return;
    }
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish();
    let url = request.url_mut();
    let full = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
        _ => encoded,
    };
    url.set_query(Some(&full));
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match &self.request {
            Ok(req) => builder
                .field("method", req.method())
                .field("url", &req.url().as_str())
                .finish(),
            Err(e) => builder.field("error", e).finish(),
        }
    }
}
