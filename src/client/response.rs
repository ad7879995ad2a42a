use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_LENGTH, SET_COOKIE};
use http::{StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use super::decoder;
use crate::cookie;
use crate::Error;

/// A response to a submitted `Request`.
///
/// Responses are cheap to clone: the body is a shared buffer and the redirect
/// history shares the same structure.
#[derive(Clone)]
pub struct Response {
    status: StatusCode,
    version: Version,
    reason: Option<String>,
    headers: HeaderMap,
    url: Url,
    body: Bytes,
    history: Vec<Response>,
    processed: u64,
    remote_addr: Option<SocketAddr>,
}

impl Response {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        reason: Option<String>,
        headers: HeaderMap,
        url: Url,
        body: Bytes,
        history: Vec<Response>,
        processed: u64,
        remote_addr: Option<SocketAddr>,
    ) -> Response {
        Response {
            status,
            version,
            reason,
            headers,
            url,
            body,
            history,
            processed,
            remote_addr,
        }
    }

    /// Get the final `Url` of this response.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the `StatusCode` of this response.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this response.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The reason phrase from the status line, when the server sent one.
    #[inline]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Get the headers of this response.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Responses that preceded this one in a redirect or auth-retry chain,
    /// oldest first.
    #[inline]
    pub fn history(&self) -> &[Response] {
        &self.history
    }

    /// Exchanges completed on the connection that produced this response,
    /// including this one (and a `CONNECT` tunnel, where one was made).
    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// The peer address this response was read from.
    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The advertised content length, if the server sent one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Retrieve the cookies contained in the response.
    ///
    /// Note that invalid `Set-Cookie` headers will be ignored.
    pub fn cookies(&self) -> impl Iterator<Item = cookie::Cookie<'_>> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .map(cookie::Cookie::parse)
            .filter_map(Result::ok)
    }

    /// The body exactly as received, before any content decoding.
    #[inline]
    pub fn raw_body(&self) -> &Bytes {
        &self.body
    }

    /// Get the body bytes, undoing any `Content-Encoding`.
    pub fn get_content(&self) -> crate::Result<Bytes> {
        decoder::decode_content(&self.headers, &self.body)
    }

    /// Get the body decoded as text.
    pub fn decode_content(&self) -> crate::Result<String> {
        let content = self.get_content()?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Try to deserialize the response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        let content = self.get_content()?;
        serde_json::from_slice(&content).map_err(Error::decode)
    }

    /// Turn a response into an error if the status is outside `[200, 400)`.
    ///
    /// ```
    /// # use gyre::Response;
    /// fn on_response(res: Response) {
    ///     match res.error_for_status() {
    ///         Ok(_res) => (),
    ///         Err(err) => {
    ///             assert_eq!(err.status(), Some(gyre::StatusCode::BAD_REQUEST));
    ///         }
    ///     }
    /// }
    /// # fn main() {}
    /// ```
    pub fn error_for_status(self) -> crate::Result<Self> {
        if success_range(self.status) {
            Ok(self)
        } else {
            Err(Error::status_code(self.url.clone(), self.status))
        }
    }

    /// Turn a reference to a response into an error if the status is outside
    /// `[200, 400)`.
    pub fn error_for_status_ref(&self) -> crate::Result<&Self> {
        if success_range(self.status) {
            Ok(self)
        } else {
            Err(Error::status_code(self.url.clone(), self.status))
        }
    }
}

fn success_range(status: StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}
