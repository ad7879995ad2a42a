//! Redirect handling.
//!
//! A 3xx response with a `Location` header produces a follow-up request on
//! the same pipeline until the per-request redirect cap is hit. 303 (and, for
//! POST, 301/302) rewrite the method to GET and drop the body; 307/308 replay
//! the original method and body.

use http::header::{HeaderMap, AUTHORIZATION, COOKIE, LOCATION, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::{Method, StatusCode};
use log::debug;
use url::Url;

pub(crate) enum Action {
    /// Follow to the URL with the (possibly rewritten) method.
    Follow { url: Url, method: Method, keep_body: bool },
    /// Not a redirect; deliver the response.
    None,
    /// A redirect past the configured cap.
    LimitReached,
}

pub(crate) fn check(
    status: StatusCode,
    method: &Method,
    headers: &HeaderMap,
    url: &Url,
    redirect_count: usize,
    max_redirects: usize,
) -> Action {
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return Action::None;
    }

    let location = match headers
        .get(LOCATION)
        .and_then(|loc| loc.to_str().ok())
        .and_then(|loc| url.join(loc).ok())
    {
        Some(location) => location,
        None => {
            debug!("redirect {status} without usable Location; delivering as-is");
            return Action::None;
        }
    };

    if redirect_count >= max_redirects {
        return Action::LimitReached;
    }

    let (method, keep_body) = match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => (method.clone(), true),
        StatusCode::SEE_OTHER if *method != Method::HEAD => (Method::GET, false),
        _ if *method == Method::POST => (Method::GET, false),
        _ => (method.clone(), true),
    };

    Action::Follow {
        url: location,
        method,
        keep_body,
    }
}

/// Strip credentialed headers when a redirect crosses origins.
pub(crate) fn remove_sensitive_headers(headers: &mut HeaderMap, next: &Url, previous: &Url) {
    let cross_host = next.host_str() != previous.host_str()
        || next.port_or_known_default() != previous.port_or_known_default();
    if cross_host {
        headers.remove(AUTHORIZATION);
        headers.remove(PROXY_AUTHORIZATION);
        headers.remove(COOKIE);
        headers.remove(WWW_AUTHENTICATE);
    }
}

#[cfg(test)]
mod tests {
    use http::header::HeaderValue;

    use super::*;

    fn headers_with_location(loc: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_str(loc).unwrap());
        headers
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn post_becomes_get_on_302() {
        let action = check(
            StatusCode::FOUND,
            &Method::POST,
            &headers_with_location("/dst"),
            &url("http://example.com/src"),
            0,
            10,
        );
        match action {
            Action::Follow { url, method, keep_body } => {
                assert_eq!(url.path(), "/dst");
                assert_eq!(method, Method::GET);
                assert!(!keep_body);
            }
            _ => panic!("expected follow"),
        }
    }

    #[test]
    fn temporary_redirect_replays_method() {
        let action = check(
            StatusCode::TEMPORARY_REDIRECT,
            &Method::POST,
            &headers_with_location("/dst"),
            &url("http://example.com/src"),
            0,
            10,
        );
        match action {
            Action::Follow { method, keep_body, .. } => {
                assert_eq!(method, Method::POST);
                assert!(keep_body);
            }
            _ => panic!("expected follow"),
        }
    }

    #[test]
    fn cap_is_enforced() {
        let action = check(
            StatusCode::FOUND,
            &Method::GET,
            &headers_with_location("/dst"),
            &url("http://example.com/src"),
            2,
            2,
        );
        assert!(matches!(action, Action::LimitReached));
    }

    #[test]
    fn missing_location_is_delivered() {
        let action = check(
            StatusCode::FOUND,
            &Method::GET,
            &HeaderMap::new(),
            &url("http://example.com/src"),
            0,
            10,
        );
        assert!(matches!(action, Action::None));
    }

    #[test]
    fn cross_host_strips_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic zzz"));
        headers.insert("x-keep", HeaderValue::from_static("1"));

        remove_sensitive_headers(
            &mut headers,
            &url("http://other.com/"),
            &url("http://example.com/"),
        );
        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers.get("x-keep").is_some());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic zzz"));
        remove_sensitive_headers(
            &mut headers,
            &url("http://example.com/a"),
            &url("http://example.com/b"),
        );
        assert!(headers.get(AUTHORIZATION).is_some());
    }
}
