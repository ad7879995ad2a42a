//! HTTP Cookies

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use cookie::Cookie as RawCookie;
use http::HeaderValue;
use log::debug;
use url::Url;

/// A single HTTP cookie, parsed from a `Set-Cookie` header.
#[derive(Debug, Clone)]
pub struct Cookie<'a>(RawCookie<'a>);

impl<'a> Cookie<'a> {
    pub(crate) fn parse(value: &'a HeaderValue) -> Result<Cookie<'a>, cookie::ParseError> {
        std::str::from_utf8(value.as_bytes())
            .map_err(cookie::ParseError::from)
            .and_then(RawCookie::parse)
            .map(Cookie)
    }

    /// Creates a new `Cookie` instance from the given name and value.
    #[inline]
    pub fn new<N, V>(name: N, value: V) -> Cookie<'a>
    where
        N: Into<Cow<'a, str>>,
        V: Into<Cow<'a, str>>,
    {
        Cookie(RawCookie::new(name, value))
    }

    /// The name of the cookie.
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The value of the cookie.
    #[inline]
    pub fn value(&self) -> &str {
        self.0.value()
    }

    /// Returns true if the 'HttpOnly' directive is enabled.
    #[inline]
    pub fn http_only(&self) -> bool {
        self.0.http_only().unwrap_or(false)
    }

    /// Returns true if the 'Secure' directive is enabled.
    #[inline]
    pub fn secure(&self) -> bool {
        self.0.secure().unwrap_or(false)
    }

    /// Returns the path directive of the cookie, if set.
    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.0.path()
    }

    /// Returns the domain directive of the cookie, if set.
    #[inline]
    pub fn domain(&self) -> Option<&str> {
        self.0.domain()
    }

    /// Get the Max-Age information.
    #[inline]
    pub fn max_age(&self) -> Option<Duration> {
        self.0.max_age().and_then(|d| d.try_into().ok())
    }

    /// The cookie expiration time.
    #[inline]
    pub fn expires(&self) -> Option<SystemTime> {
        match self.0.expires() {
            Some(cookie::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
            None | Some(cookie::Expiration::Session) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    domain: String,
    path: String,
    name: String,
}

#[derive(Debug, Clone)]
struct Stored {
    value: String,
    host_only: bool,
    secure: bool,
    expires: Option<SystemTime>,
}

/// A cookie jar keyed by `(domain, path, name)`.
///
/// Populated from `Set-Cookie` response headers and serialized into `Cookie`
/// request headers with RFC 6265 domain/path matching. The jar is loop-local;
/// the client keeps one per instance.
#[derive(Debug, Default)]
pub struct Jar {
    cookies: HashMap<Key, Stored>,
}

impl Jar {
    /// An empty jar.
    pub fn new() -> Jar {
        Jar::default()
    }

    /// Add a cookie to this jar, as if `cookie` had arrived in a `Set-Cookie`
    /// header for a response from `url`.
    pub fn add_cookie_str(&mut self, cookie: &str, url: &Url) {
        match RawCookie::parse(cookie) {
            Ok(parsed) => self.store(&Cookie(parsed), url),
            Err(e) => debug!("invalid cookie ignored: {e}"),
        }
    }

    /// Store every `Set-Cookie` value from a response to `url`. Invalid
    /// headers are ignored.
    pub(crate) fn set_cookies<'a>(
        &mut self,
        headers: impl Iterator<Item = &'a HeaderValue>,
        url: &Url,
    ) {
        for header in headers {
            match Cookie::parse(header) {
                Ok(cookie) => self.store(&cookie, url),
                Err(e) => debug!("invalid Set-Cookie ignored: {e}"),
            }
        }
    }

    /// The `name=value` pairs applicable to a request for `url`, in stored
    /// order. Expired entries are dropped as a side effect.
    pub(crate) fn matching(&mut self, url: &Url) -> Vec<(String, String)> {
        let now = SystemTime::now();
        self.cookies
            .retain(|_, stored| stored.expires.map(|at| at > now).unwrap_or(true));

        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return Vec::new(),
        };
        let https = url.scheme() == "https";

        let mut matched: Vec<(&Key, &Stored)> = self
            .cookies
            .iter()
            .filter(|(key, stored)| {
                domain_match(&host, &key.domain, stored.host_only)
                    && path_match(url.path(), &key.path)
                    && (!stored.secure || https)
            })
            .collect();
        // Longer paths first, per RFC 6265 §5.4.
        matched.sort_by(|a, b| b.0.path.len().cmp(&a.0.path.len()));

        matched
            .into_iter()
            .map(|(key, stored)| (key.name.clone(), stored.value.clone()))
            .collect()
    }

    /// Drop every stored cookie.
    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Number of stored cookies.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Whether the jar holds no cookies.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    fn store(&mut self, cookie: &Cookie<'_>, url: &Url) {
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return,
        };

        let (domain, host_only) = match cookie.domain() {
            Some(domain) => {
                let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                if !domain_match(&host, &domain, false) {
                    debug!("cookie domain {domain} does not cover {host}; ignored");
                    return;
                }
                (domain, false)
            }
            None => (host.clone(), true),
        };

        let path = cookie
            .path()
            .filter(|p| p.starts_with('/'))
            .map(str::to_owned)
            .unwrap_or_else(|| default_path(url));

        let expires = match cookie.max_age() {
            Some(age) => Some(SystemTime::now() + age),
            None => cookie.expires(),
        };
        let expired = cookie.0.max_age().map(|age| age.is_negative()).unwrap_or(false)
            || expires.map(|at| at <= SystemTime::now()).unwrap_or(false);

        let key = Key {
            domain,
            path,
            name: cookie.name().to_owned(),
        };

        if expired {
            self.cookies.remove(&key);
            return;
        }

        self.cookies.insert(
            key,
            Stored {
                value: cookie.value().to_owned(),
                host_only,
                secure: cookie.secure(),
                expires,
            },
        );
    }
}

impl fmt::Display for Jar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Jar({} cookies)", self.cookies.len())
    }
}

fn domain_match(host: &str, domain: &str, host_only: bool) -> bool {
    if host == domain {
        return true;
    }
    if host_only {
        return false;
    }
    host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
        && host.parse::<std::net::IpAddr>().is_err()
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

// RFC 6265 §5.1.4: everything up to the last '/' of the request path.
fn default_path(url: &Url) -> String {
    let path = url.path();
    if !path.starts_with('/') {
        return "/".to_owned();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(i) => path[..i].to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn host_cookie_round_trip() {
        let mut jar = Jar::new();
        let u = url("http://example.com/get");
        jar.add_cookie_str("bla=foo", &u);

        assert_eq!(jar.matching(&u), [("bla".to_owned(), "foo".to_owned())]);
        // Host-only: a sibling host must not see it.
        assert!(jar.matching(&url("http://www.example.com/get")).is_empty());
    }

    #[test]
    fn domain_cookie_covers_subdomains() {
        let mut jar = Jar::new();
        jar.add_cookie_str("a=1; Domain=example.com", &url("http://example.com/"));

        assert_eq!(jar.matching(&url("http://www.example.com/")).len(), 1);
        assert!(jar.matching(&url("http://notexample.com/")).is_empty());
    }

    #[test]
    fn path_scoping() {
        let mut jar = Jar::new();
        jar.add_cookie_str("a=1; Path=/docs", &url("http://example.com/"));

        assert_eq!(jar.matching(&url("http://example.com/docs")).len(), 1);
        assert_eq!(jar.matching(&url("http://example.com/docs/web")).len(), 1);
        assert!(jar.matching(&url("http://example.com/d")).is_empty());
    }

    #[test]
    fn secure_cookie_needs_https() {
        let mut jar = Jar::new();
        jar.add_cookie_str("a=1; Secure", &url("https://example.com/"));

        assert!(jar.matching(&url("http://example.com/")).is_empty());
        assert_eq!(jar.matching(&url("https://example.com/")).len(), 1);
    }

    #[test]
    fn negative_max_age_removes() {
        let mut jar = Jar::new();
        let u = url("http://example.com/");
        jar.add_cookie_str("a=1", &u);
        assert_eq!(jar.len(), 1);
        jar.add_cookie_str("a=gone; Max-Age=0", &u);
        assert!(jar.is_empty());
    }

    #[test]
    fn foreign_domain_rejected() {
        let mut jar = Jar::new();
        jar.add_cookie_str("a=1; Domain=evil.com", &url("http://example.com/"));
        assert!(jar.is_empty());
    }
}
