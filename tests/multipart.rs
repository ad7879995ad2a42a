mod support;

use gyre::multipart::{Form, Part};
use gyre::StatusCode;
use support::server;

#[test]
fn text_and_file_parts_round_trip() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let deferred = client
        .post(server.url("/post"))
        .form(&[("field", "value with spaces")])
        .file("upload", "notes.txt", &b"file bytes, verbatim"[..])
        .send();
    let res = el.run_until(&deferred).unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: serde_json::Value = res.json().unwrap();
    assert_eq!(body["form"]["field"], "value with spaces");
    assert_eq!(body["files"]["upload"], "file bytes, verbatim");
}

#[test]
fn prebuilt_form_is_sent_as_is() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let form = Form::new()
        .text("username", "seanmonstar")
        .part(
            "photo",
            Part::bytes(&b"not actually a png"[..])
                .file_name("photo.png")
                .mime_str("image/png")
                .unwrap(),
        );
    let boundary = form.boundary().to_owned();

    let deferred = client.post(server.url("/post")).multipart(form).send();
    let res = el.run_until(&deferred).unwrap();

    let body: serde_json::Value = res.json().unwrap();
    assert_eq!(body["form"]["username"], "seanmonstar");
    assert_eq!(body["files"]["photo"], "not actually a png");
    let content_type = body["headers"]["content-type"].as_str().unwrap();
    assert!(content_type.contains(&boundary));
}

#[test]
fn multipart_content_type_carries_the_boundary() {
    let server = server::http();
    let (mut el, client) = support::setup();

    let deferred = client
        .post(server.url("/post"))
        .form(&[("k", "v")])
        .send();
    let res = el.run_until(&deferred).unwrap();

    let body: serde_json::Value = res.json().unwrap();
    let content_type = body["headers"]["content-type"].as_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
}
