//! HTTP/1.x wire protocol: request head encoding and incremental response
//! parsing.
//!
//! The parser is push-based: the connection feeds whatever bytes arrived,
//! the exchange asks for the head and then drives the body decoder chosen
//! from the framing headers (`Content-Length`, chunked, or close-delimited).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A parsed response status line and header block.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body at all (HEAD, 1xx, 204, 304, or Content-Length: 0).
    Empty,
    Length(u64),
    Chunked,
    /// HTTP/1.0 style: the body runs until the peer closes.
    Eof,
}

enum State {
    Head,
    Body(BodyDecoder),
    Done,
}

/// Incremental HTTP/1.x response parser.
pub(crate) struct ResponseParser {
    buf: BytesMut,
    state: State,
}

impl ResponseParser {
    pub(crate) fn new() -> ResponseParser {
        ResponseParser {
            buf: BytesMut::with_capacity(8 * 1024),
            state: State::Head,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to parse the status line and headers.
    ///
    /// Returns `None` until a full head has arrived. May only be called
    /// before [`begin_body`](ResponseParser::begin_body) or after a
    /// [`reset`](ResponseParser::reset).
    pub(crate) fn parse_head(&mut self) -> crate::Result<Option<ResponseHead>> {
        debug_assert!(matches!(self.state, State::Head));
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut header_buf);

        let consumed = match response.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Err(crate::Error::protocol("response head too large"));
                }
                return Ok(None);
            }
            Err(e) => return Err(crate::Error::protocol(e.to_string())),
        };

        let version = match response.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let status = StatusCode::from_u16(response.code.expect("complete response has code"))
            .map_err(crate::Error::protocol)?;
        let reason = response
            .reason
            .filter(|r| !r.is_empty())
            .map(str::to_owned);

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for header in response.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(crate::Error::protocol)?;
            let value =
                HeaderValue::from_bytes(header.value).map_err(crate::Error::protocol)?;
            headers.append(name, value);
        }

        self.buf.advance(consumed);
        Ok(Some(ResponseHead {
            version,
            status,
            reason,
            headers,
        }))
    }

    /// Install the body decoder for the framing the head dictated.
    pub(crate) fn begin_body(&mut self, framing: Framing) {
        self.state = match framing {
            Framing::Empty => State::Done,
            Framing::Length(0) => State::Done,
            Framing::Length(n) => State::Body(BodyDecoder::Length { remaining: n }),
            Framing::Chunked => State::Body(BodyDecoder::Chunked(Chunked::new())),
            Framing::Eof => State::Body(BodyDecoder::Eof),
        };
    }

    /// Decode whatever body bytes are buffered. Returns the newly decoded
    /// data and whether the body is now complete.
    pub(crate) fn decode_body(&mut self) -> crate::Result<(Bytes, bool)> {
        let mut out = BytesMut::new();
        match &mut self.state {
            State::Head => Ok((out.freeze(), false)),
            State::Done => Ok((out.freeze(), true)),
            State::Body(decoder) => {
                let done = decoder.decode(&mut self.buf, &mut out)?;
                if done {
                    self.state = State::Done;
                }
                Ok((out.freeze(), done))
            }
        }
    }

    #[allow(dead_code)]
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// The peer closed the connection; close-delimited bodies complete here,
    /// anything else mid-flight is truncation.
    pub(crate) fn finish_eof(&mut self) -> crate::Result<()> {
        match &self.state {
            State::Done => Ok(()),
            State::Body(BodyDecoder::Eof) => {
                self.state = State::Done;
                Ok(())
            }
            State::Body(_) => Err(crate::Error::protocol("connection closed mid-body")),
            State::Head => Err(crate::Error::connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection closed before response",
            ))),
        }
    }

    /// Rewind to expect a fresh head, keeping unconsumed bytes.
    ///
    /// Used after a `100 Continue` interim response and when a kept-alive
    /// connection starts its next exchange.
    pub(crate) fn reset(&mut self) {
        self.state = State::Head;
    }
}

enum BodyDecoder {
    Length { remaining: u64 },
    Chunked(Chunked),
    Eof,
}

impl BodyDecoder {
    fn decode(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> crate::Result<bool> {
        match self {
            BodyDecoder::Length { remaining } => {
                let take = (*remaining).min(buf.len() as u64) as usize;
                out.put_slice(&buf.split_to(take));
                *remaining -= take as u64;
                Ok(*remaining == 0)
            }
            BodyDecoder::Eof => {
                out.put_slice(&buf.split_to(buf.len()));
                Ok(false)
            }
            BodyDecoder::Chunked(chunked) => chunked.decode(buf, out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Ext,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    EndLf,
    Done,
}

struct Chunked {
    state: ChunkState,
    size: u64,
    remaining: u64,
}

impl Chunked {
    fn new() -> Chunked {
        Chunked {
            state: ChunkState::Size,
            size: 0,
            remaining: 0,
        }
    }

    fn decode(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> crate::Result<bool> {
        use ChunkState::*;

        while self.state != Done {
            if self.state == Data {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = self.remaining.min(buf.len() as u64) as usize;
                out.put_slice(&buf.split_to(take));
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.state = DataCr;
                }
                continue;
            }

            let Some(&byte) = buf.first() else {
                return Ok(false);
            };
            buf.advance(1);

            self.state = match self.state {
                Size => match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        if self.size > u64::MAX / 16 {
                            return Err(crate::Error::protocol("chunk size overflow"));
                        }
                        self.size = self.size * 16 + hex_value(byte);
                        Size
                    }
                    b';' => Ext,
                    b'\r' => SizeLf,
                    b'\n' => self.after_size(),
                    _ => return Err(crate::Error::protocol("invalid chunk size line")),
                },
                Ext => match byte {
                    b'\r' => SizeLf,
                    b'\n' => self.after_size(),
                    _ => Ext,
                },
                SizeLf => match byte {
                    b'\n' => self.after_size(),
                    _ => return Err(crate::Error::protocol("malformed chunk size end")),
                },
                DataCr => match byte {
                    b'\r' => DataLf,
                    b'\n' => Size,
                    _ => return Err(crate::Error::protocol("missing chunk data terminator")),
                },
                DataLf => match byte {
                    b'\n' => Size,
                    _ => return Err(crate::Error::protocol("missing chunk data terminator")),
                },
                TrailerStart => match byte {
                    b'\r' => EndLf,
                    b'\n' => Done,
                    _ => TrailerLine,
                },
                TrailerLine => match byte {
                    b'\n' => TrailerStart,
                    _ => TrailerLine,
                },
                EndLf => match byte {
                    b'\n' => Done,
                    _ => return Err(crate::Error::protocol("malformed chunked trailer")),
                },
                Data | Done => unreachable!("handled above"),
            };
        }

        Ok(true)
    }

    fn after_size(&mut self) -> ChunkState {
        if self.size == 0 {
            ChunkState::TrailerStart
        } else {
            self.remaining = self.size;
            self.size = 0;
            ChunkState::Data
        }
    }
}

fn hex_value(byte: u8) -> u64 {
    match byte {
        b'0'..=b'9' => (byte - b'0') as u64,
        b'a'..=b'f' => (byte - b'a' + 10) as u64,
        _ => (byte - b'A' + 10) as u64,
    }
}

/// Decide the body framing from the request method and response head.
pub(crate) fn body_framing(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> crate::Result<Framing> {
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }

    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }

    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| crate::Error::protocol("invalid Content-Length"))?;
        return Ok(if length == 0 {
            Framing::Empty
        } else {
            Framing::Length(length)
        });
    }

    Ok(Framing::Eof)
}

pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the peer agreed to keep the connection open after this response.
pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if version == Version::HTTP_10 {
        connection_has(headers, "keep-alive")
    } else {
        !connection_has(headers, "close")
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Serialize a request head (request line plus header block).
pub(crate) fn encode_head(
    buf: &mut BytesMut,
    method: &Method,
    target: &str,
    version: Version,
    headers: &HeaderMap,
) {
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(version_str(version).as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_full(raw: &[u8]) -> (ResponseHead, Bytes) {
        let mut parser = ResponseParser::new();
        parser.feed(raw);
        let head = parser.parse_head().unwrap().expect("complete head");
        let framing = body_framing(&Method::GET, head.status, &head.headers).unwrap();
        parser.begin_body(framing);
        let (body, done) = parser.decode_body().unwrap();
        assert!(done || framing == Framing::Eof);
        (head, body)
    }

    #[test]
    fn parses_content_length_response() {
        let (head, body) =
            parse_full(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nx-a: b\r\n\r\nhello");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.reason.as_deref(), Some("OK"));
        assert_eq!(head.headers.get("x-a").unwrap(), "b");
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn head_arrives_in_pieces() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\ncontent-le");
        assert!(parser.parse_head().unwrap().is_none());
        parser.feed(b"ngth: 2\r\n\r\nok");
        let head = parser.parse_head().unwrap().unwrap();
        parser.begin_body(body_framing(&Method::GET, head.status, &head.headers).unwrap());
        let (body, done) = parser.decode_body().unwrap();
        assert!(done);
        assert_eq!(body, Bytes::from_static(b"ok"));
    }

    #[test]
    fn chunked_decoding_across_feeds() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
        let head = parser.parse_head().unwrap().unwrap();
        parser.begin_body(body_framing(&Method::GET, head.status, &head.headers).unwrap());

        let mut collected = Vec::new();
        for piece in [&b"4\r\nwik"[..], &b"i\r\n5\r\npedia\r"[..], &b"\n0\r\n\r\n"[..]] {
            parser.feed(piece);
            let (data, _) = parser.decode_body().unwrap();
            collected.extend_from_slice(&data);
        }
        assert!(parser.is_done());
        assert_eq!(collected, b"wikipedia");
    }

    #[test]
    fn chunked_with_extension_and_trailer() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
        let head = parser.parse_head().unwrap().unwrap();
        parser.begin_body(body_framing(&Method::GET, head.status, &head.headers).unwrap());

        parser.feed(b"3;name=val\r\nabc\r\n0\r\nexpires: never\r\n\r\n");
        let (data, done) = parser.decode_body().unwrap();
        assert!(done);
        assert_eq!(data, Bytes::from_static(b"abc"));
    }

    #[test]
    fn bad_chunk_size_is_a_protocol_error() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nzz\r\n");
        let head = parser.parse_head().unwrap().unwrap();
        parser.begin_body(body_framing(&Method::GET, head.status, &head.headers).unwrap());
        assert!(parser.decode_body().unwrap_err().is_protocol());
    }

    #[test]
    fn eof_delimited_body() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.0 200 OK\r\n\r\npartial");
        let head = parser.parse_head().unwrap().unwrap();
        assert_eq!(head.version, Version::HTTP_10);
        parser.begin_body(body_framing(&Method::GET, head.status, &head.headers).unwrap());

        let (data, done) = parser.decode_body().unwrap();
        assert_eq!(data, Bytes::from_static(b"partial"));
        assert!(!done);
        parser.finish_eof().unwrap();
        assert!(parser.is_done());
    }

    #[test]
    fn truncated_length_body_is_an_error() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nabc");
        let head = parser.parse_head().unwrap().unwrap();
        parser.begin_body(body_framing(&Method::GET, head.status, &head.headers).unwrap());
        parser.decode_body().unwrap();
        assert!(parser.finish_eof().unwrap_err().is_protocol());
    }

    #[test]
    fn head_method_has_no_body() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "123".parse().unwrap());
        let framing = body_framing(&Method::HEAD, StatusCode::OK, &headers).unwrap();
        assert_eq!(framing, Framing::Empty);
    }

    #[test]
    fn interim_100_then_real_response() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 417 Expectation Failed\r\ncontent-length: 0\r\n\r\n");
        let interim = parser.parse_head().unwrap().unwrap();
        assert_eq!(interim.status, StatusCode::CONTINUE);

        parser.reset();
        let real = parser.parse_head().unwrap().unwrap();
        assert_eq!(real.status, StatusCode::EXPECTATION_FAILED);
    }

    #[test]
    fn keep_alive_defaults_per_version() {
        assert!(keep_alive(Version::HTTP_11, &HeaderMap::new()));
        assert!(!keep_alive(Version::HTTP_10, &HeaderMap::new()));

        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "close".parse().unwrap());
        assert!(!keep_alive(Version::HTTP_11, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "Keep-Alive".parse().unwrap());
        assert!(keep_alive(Version::HTTP_10, &headers));
    }

    #[test]
    fn encodes_request_head() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        headers.insert("accept-encoding", "gzip, deflate".parse().unwrap());

        let mut buf = BytesMut::new();
        encode_head(&mut buf, &Method::GET, "/get?bla=foo", Version::HTTP_11, &headers);
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("GET /get?bla=foo HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
