//! A small httpbin-flavored HTTP/1.x test server on plain std sockets.
//!
//! The crate under test *is* the async runtime, so the server deliberately
//! uses blocking I/O and a thread per connection.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct Server {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
    }
}

pub fn http() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));

    let flag = shutdown.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            let Ok(stream) = stream else { break };
            thread::spawn(move || {
                let _ = handle_connection(stream);
            });
        }
    });

    Server { addr, shutdown }
}

struct Req {
    method: String,
    target: String,
    path: String,
    query: BTreeMap<String, String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    absolute_form: bool,
}

impl Req {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn wants_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct Resp {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    close: bool,
    raw: Option<Vec<u8>>,
}

impl Resp {
    fn new(status: u16) -> Resp {
        Resp {
            status,
            ..Resp::default()
        }
    }

    fn header(mut self, name: &str, value: &str) -> Resp {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    fn json(mut self, value: serde_json::Value) -> Resp {
        self.body = serde_json::to_vec(&value).unwrap();
        self.headers
            .push(("content-type".to_owned(), "application/json".to_owned()));
        self
    }

    fn close(mut self) -> Resp {
        self.close = true;
        self
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            302 => "Found",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            417 => "Expectation Failed",
            _ => "Response",
        }
    }
}

fn handle_connection(mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let mut buffered = Vec::new();

    loop {
        let Some(req) = read_request(&mut stream, &mut buffered)? else {
            return Ok(());
        };
        let close = req.wants_close();
        let resp = route(&req, &mut stream, &mut buffered)?;
        let Some(resp) = resp else { return Ok(()) };

        if let Some(raw) = &resp.raw {
            stream.write_all(raw)?;
            return Ok(());
        }

        let mut head = format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason());
        head.push_str(&format!("content-length: {}\r\n", resp.body.len()));
        if resp.close || close {
            head.push_str("connection: close\r\n");
        }
        for (name, value) in &resp.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes())?;
        if req.method != "HEAD" {
            stream.write_all(&resp.body)?;
        }
        stream.flush()?;

        if resp.close || close {
            return Ok(());
        }
    }
}

/// Read one request head (and body, unless the client is holding it for a
/// `100-continue`). Returns `None` on clean EOF between requests.
fn read_request(stream: &mut TcpStream, buffered: &mut Vec<u8>) -> std::io::Result<Option<Req>> {
    let head_end = loop {
        if let Some(pos) = find(buffered, b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buffered.extend_from_slice(&chunk[..n]);
    };

    let head: Vec<u8> = buffered.drain(..head_end).collect();
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_buf);
    parsed
        .parse(&head)
        .expect("test server got malformed request");

    let method = parsed.method.unwrap().to_owned();
    let target = parsed.path.unwrap().to_owned();
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let (path_query, absolute_form) = if let Some(rest) = target.strip_prefix("http://") {
        let slash = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
        (slash.to_owned(), true)
    } else {
        (target.clone(), false)
    };
    let (path, query) = match path_query.split_once('?') {
        Some((p, q)) => (p.to_owned(), parse_query(q)),
        None => (path_query, BTreeMap::new()),
    };

    let mut req = Req {
        method,
        target,
        path,
        query,
        headers,
        body: Vec::new(),
        absolute_form,
    };

    let expecting = req
        .header("expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);
    let content_length: usize = req
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if expecting {
        // The route decides whether to invite the body.
        return Ok(Some(req));
    }

    while buffered.len() < content_length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
    req.body = buffered.drain(..content_length.min(buffered.len())).collect();
    Ok(Some(req))
}

fn route(
    req: &Req,
    stream: &mut TcpStream,
    buffered: &mut Vec<u8>,
) -> std::io::Result<Option<Resp>> {
    let path = req.path.clone();

    if path == "/expect" {
        // Refuse the expectation; the body must never arrive.
        return Ok(Some(Resp::new(417).json(
            serde_json::json!({"refused": true}),
        )));
    }

    // Routes below want the body; invite it if the client is waiting.
    let req = if req.header("expect").is_some() {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        stream.flush()?;
        let content_length: usize = req
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while buffered.len() < content_length {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            buffered.extend_from_slice(&chunk[..n]);
        }
        let mut full = Req {
            method: req.method.clone(),
            target: req.target.clone(),
            path: req.path.clone(),
            query: req.query.clone(),
            headers: req.headers.clone(),
            body: buffered.drain(..content_length.min(buffered.len())).collect(),
            absolute_form: req.absolute_form,
        };
        full.headers.retain(|(n, _)| n != "expect");
        full
    } else {
        Req {
            method: req.method.clone(),
            target: req.target.clone(),
            path: req.path.clone(),
            query: req.query.clone(),
            headers: req.headers.clone(),
            body: req.body.clone(),
            absolute_form: req.absolute_form,
        }
    };

    let resp = match path.as_str() {
        "/get" | "/anything" => echo(&req),
        "/post" => echo(&req),
        "/close" => Resp::new(200)
            .json(serde_json::json!({"closing": true}))
            .close(),
        "/http10" => {
            let mut raw = Resp::new(200);
            raw.raw = Some(
                b"HTTP/1.0 200 OK\r\ncontent-type: text/plain\r\n\r\nold school".to_vec(),
            );
            raw
        }
        "/chunked" => {
            let mut raw = Resp::new(200);
            raw.raw = Some(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n\
                  6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n"
                    .to_vec(),
            );
            raw
        }
        "/gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(br#"{"gzipped": true}"#).unwrap();
            let body = enc.finish().unwrap();
            let mut resp = Resp::new(200).header("content-encoding", "gzip");
            resp.body = body;
            resp
        }
        "/cookies" => {
            let mut cookies = serde_json::Map::new();
            if let Some(header) = req.header("cookie") {
                for pair in header.split("; ") {
                    if let Some((name, value)) = pair.split_once('=') {
                        cookies.insert(name.to_owned(), serde_json::Value::from(value));
                    }
                }
            }
            Resp::new(200).json(serde_json::json!({ "cookies": cookies }))
        }
        "/cookies/set" => {
            let mut resp = Resp::new(302).header("location", "/cookies");
            for (name, value) in &req.query {
                resp = resp.header("set-cookie", &format!("{name}={value}; Path=/"));
            }
            resp
        }
        path if path.starts_with("/redirect/") => {
            let n: u32 = path["/redirect/".len()..].parse().unwrap_or(1);
            let location = if n <= 1 {
                "/get".to_owned()
            } else {
                format!("/redirect/{}", n - 1)
            };
            Resp::new(302).header("location", &location)
        }
        "/redirect-post" => {
            if req.method == "POST" {
                Resp::new(302).header("location", "/anything")
            } else {
                Resp::new(400).json(serde_json::json!({"error": "expected POST"}))
            }
        }
        path if path.starts_with("/status/") => {
            let code: u16 = path["/status/".len()..].parse().unwrap_or(200);
            let resp = Resp::new(code).json(serde_json::json!({ "status": code }));
            // Error statuses tear the connection down, like the original
            // suite's server.
            if code >= 400 {
                resp.close()
            } else {
                resp
            }
        }
        path if path.starts_with("/basic-auth/") => {
            let mut parts = path["/basic-auth/".len()..].splitn(2, '/');
            let user = parts.next().unwrap_or("");
            let pass = parts.next().unwrap_or("");
            basic_auth(&req, user, pass)
        }
        path if path.starts_with("/digest-auth/") => {
            let mut parts = path["/digest-auth/".len()..].splitn(2, '/');
            let user = parts.next().unwrap_or("");
            let pass = parts.next().unwrap_or("");
            digest_auth(&req, user, pass)
        }
        "/slow" => {
            thread::sleep(Duration::from_millis(500));
            Resp::new(200).json(serde_json::json!({"slow": true}))
        }
        _ => Resp::new(404).json(serde_json::json!({"error": "not found"})),
    };

    Ok(Some(resp))
}

/// httpbin-style request echo.
fn echo(req: &Req) -> Resp {
    let args: serde_json::Map<String, serde_json::Value> = req
        .query
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
        .collect();
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
        .collect();

    let content_type = req.header("content-type").unwrap_or("").to_owned();
    let mut form = serde_json::Map::new();
    let mut files = serde_json::Map::new();
    let mut json = serde_json::Value::Null;
    let mut data = String::new();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        for (k, v) in parse_query(&String::from_utf8_lossy(&req.body)) {
            form.insert(k, serde_json::Value::from(v));
        }
    } else if content_type.starts_with("multipart/form-data") {
        if let Some(boundary) = content_type.split("boundary=").nth(1) {
            parse_multipart(&req.body, boundary, &mut form, &mut files);
        }
    } else if content_type.starts_with("application/json") {
        json = serde_json::from_slice(&req.body).unwrap_or(serde_json::Value::Null);
    } else if !req.body.is_empty() {
        data = String::from_utf8_lossy(&req.body).into_owned();
    }

    Resp::new(200).json(serde_json::json!({
        "method": req.method,
        "args": args,
        "headers": headers,
        "form": form,
        "files": files,
        "json": json,
        "data": data,
        "absolute_uri": req.absolute_form,
        "target": req.target,
    }))
}

fn basic_auth(req: &Req, user: &str, pass: &str) -> Resp {
    use base64::prelude::*;

    let expected = format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{user}:{pass}"))
    );
    match req.header("authorization") {
        Some(header) if header == expected => {
            Resp::new(200).json(serde_json::json!({"authenticated": true, "user": user}))
        }
        _ => Resp::new(401).header("www-authenticate", "Basic realm=\"Fake Realm\""),
    }
}

const DIGEST_REALM: &str = "gyre@test";
const DIGEST_NONCE: &str = "dcd98b7102dd2f0e8b11d0f600bfb0c093";

fn digest_auth(req: &Req, user: &str, pass: &str) -> Resp {
    let challenge = || {
        Resp::new(401).header(
            "www-authenticate",
            &format!("Digest realm=\"{DIGEST_REALM}\", nonce=\"{DIGEST_NONCE}\", qop=\"auth\""),
        )
    };

    let Some(authorization) = req.header("authorization") else {
        return challenge();
    };
    let Some(params) = authorization.strip_prefix("Digest ") else {
        return challenge();
    };

    let mut fields = BTreeMap::new();
    for piece in params.split(", ") {
        if let Some((key, value)) = piece.split_once('=') {
            fields.insert(key.trim().to_owned(), value.trim_matches('"').to_owned());
        }
    }

    let uri = fields.get("uri").cloned().unwrap_or_default();
    let nc = fields.get("nc").cloned().unwrap_or_default();
    let cnonce = fields.get("cnonce").cloned().unwrap_or_default();
    let response = fields.get("response").cloned().unwrap_or_default();

    let ha1 = md5_hex(format!("{user}:{DIGEST_REALM}:{pass}").as_bytes());
    let ha2 = md5_hex(format!("{}:{uri}", req.method).as_bytes());
    let expected = md5_hex(format!("{ha1}:{DIGEST_NONCE}:{nc}:{cnonce}:auth:{ha2}").as_bytes());

    if fields.get("username").map(String::as_str) == Some(user) && response == expected {
        Resp::new(200).json(serde_json::json!({"authenticated": true, "user": user}))
    } else {
        challenge()
    }
}

fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest as _, Md5};
    Md5::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn parse_multipart(
    body: &[u8],
    boundary: &str,
    form: &mut serde_json::Map<String, serde_json::Value>,
    files: &mut serde_json::Map<String, serde_json::Value>,
) {
    let delim = format!("--{boundary}");
    let text = body;

    let mut offset = 0;
    while let Some(start) = find(&text[offset..], delim.as_bytes()) {
        let part_start = offset + start + delim.len();
        if text[part_start..].starts_with(b"--") {
            break;
        }
        // Skip the CRLF after the boundary line.
        let part_start = part_start + 2;
        let Some(head_len) = find(&text[part_start..], b"\r\n\r\n") else {
            break;
        };
        let headers = String::from_utf8_lossy(&text[part_start..part_start + head_len]);
        let content_start = part_start + head_len + 4;
        let Some(content_len) = find(&text[content_start..], delim.as_bytes()) else {
            break;
        };
        // Trailing CRLF before the next boundary belongs to the framing.
        let content = &text[content_start..content_start + content_len - 2];

        let mut name = String::new();
        let mut filename: Option<String> = None;
        for line in headers.lines() {
            if line.to_ascii_lowercase().starts_with("content-disposition") {
                for attr in line.split(';') {
                    let attr = attr.trim();
                    if let Some(v) = attr.strip_prefix("name=\"") {
                        name = v.trim_end_matches('"').to_owned();
                    }
                    if let Some(v) = attr.strip_prefix("filename=\"") {
                        filename = Some(v.trim_end_matches('"').to_owned());
                    }
                }
            }
        }

        let value = serde_json::Value::from(String::from_utf8_lossy(content).into_owned());
        if filename.is_some() {
            files.insert(name, value);
        } else {
            form.insert(name, value);
        }
        offset = content_start + content_len;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
