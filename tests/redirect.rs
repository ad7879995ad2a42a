mod support;

use gyre::StatusCode;
use support::server;

#[test]
fn redirect_chain_is_followed_on_one_connection() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let res = el
        .run_until(&client.get(server.url("/redirect/6")).send())
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.url().as_str().ends_with("/get"));
    assert_eq!(res.history().len(), 6);
    for hop in res.history() {
        assert_eq!(hop.status(), StatusCode::FOUND);
    }
    // All seven exchanges rode the same keep-alive connection.
    assert_eq!(res.processed(), 7);
    assert_eq!(client.sessions(), 1);
    assert_eq!(client.requests_processed(), 7);
    assert_eq!(client.pool_stats(server.url("/")), Some((1, 0)));
}

#[test]
fn redirect_cap_fails_with_partial_history() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let deferred = client
        .get(server.url("/redirect/5"))
        .max_redirects(2)
        .send();
    let err = el.run_until(&deferred).unwrap_err();

    assert!(err.is_redirect());
    let last = err.response().expect("redirect error carries the last response");
    assert_eq!(last.history().len(), 2);
    assert!(last.history()[0].url().as_str().ends_with("/redirect/5"));
    assert!(last.history()[1].url().as_str().ends_with("/redirect/4"));
    assert!(last.url().as_str().ends_with("/redirect/3"));
}

#[test]
fn post_redirect_becomes_get() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let deferred = client
        .post(server.url("/redirect-post"))
        .body("dropped on redirect")
        .send();
    let res = el.run_until(&deferred).unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().unwrap();
    assert_eq!(body["method"], "GET");
    assert_eq!(body["data"], "");
}

#[test]
fn zero_max_redirects_delivers_nothing_but_errors() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let deferred = client
        .get(server.url("/redirect/1"))
        .max_redirects(0)
        .send();
    let err = el.run_until(&deferred).unwrap_err();

    assert!(err.is_redirect());
    let last = err.response().unwrap();
    assert!(last.history().is_empty());
    assert_eq!(last.status(), StatusCode::FOUND);
}

#[test]
fn basic_auth_header_not_carried_on_redirect() {
    let server = server::http();
    let (mut el, client) = support::setup();

    // basic_auth lives in the unredirected set; after one hop the echo
    // endpoint must not see it.
    let deferred = client
        .get(server.url("/redirect/1"))
        .basic_auth("user", Some("pass"))
        .send();
    let res = el.run_until(&deferred).unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().unwrap();
    assert!(body["headers"]["authorization"].is_null());
}
