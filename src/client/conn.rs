//! Transport connections: non-blocking dial, TLS wrapping, and `CONNECT`
//! tunneling through HTTP proxies.
//!
//! Dialing is a small state machine driven by readiness events:
//! **Connecting → (TunnelWrite → TunnelRead)? → TlsHandshake? → Done**.
//! The tunnel legs only exist for TLS targets behind a proxy; plain targets
//! behind a proxy skip straight to Done and use absolute-form request lines
//! instead.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, trace};
use mio::net::TcpStream;
use mio::Interest;
use native_tls::{HandshakeError, MidHandshakeTlsStream, TlsConnector, TlsStream};

use super::proto::ResponseParser;
use crate::dns;
use crate::proxy::ProxyScheme;
use crate::runtime::{Deferred, Executor, IoToken, LoopHandle, Readiness};
use crate::Error;

pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Handshaking(Option<MidHandshakeTlsStream<TcpStream>>),
}

impl Transport {
    pub(crate) fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref(),
            Transport::Handshaking(Some(mid)) => mid.get_ref(),
            Transport::Handshaking(None) => unreachable!("handshake stream taken"),
        }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_mut(),
            Transport::Handshaking(Some(mid)) => mid.get_mut(),
            Transport::Handshaking(None) => unreachable!("handshake stream taken"),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
            Transport::Handshaking(_) => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
            Transport::Handshaking(_) => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
            Transport::Handshaking(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self {
            Transport::Plain(_) => "plain",
            Transport::Tls(_) => "tls",
            Transport::Handshaking(_) => "handshaking",
        };
        f.write_str(kind)
    }
}

/// A pooled transport connection.
///
/// `processed` counts completed exchanges on this socket (a `CONNECT` tunnel
/// counts as one); `idle_at` is stamped when the connection parks in its
/// pool.
pub(crate) struct Conn {
    pub(crate) token: IoToken,
    pub(crate) transport: Transport,
    pub(crate) processed: u64,
    pub(crate) idle_at: Option<Instant>,
}

/// Single-claim carrier handing a `Conn` through deferred continuations.
pub(crate) type ConnCell = Rc<RefCell<Option<Conn>>>;

pub(crate) fn cell(conn: Conn) -> ConnCell {
    Rc::new(RefCell::new(Some(conn)))
}

impl Conn {
    /// Deregister from the loop and drop the socket.
    pub(crate) fn close(mut self, handle: &LoopHandle) {
        let token = self.token;
        if let Err(e) = handle.deregister(self.transport.socket_mut(), token) {
            debug!("deregister on close failed: {e}");
        }
    }

    /// Whether an idle connection can serve another exchange.
    pub(crate) fn is_usable(&self, keep_alive: Duration) -> bool {
        if let Some(idle_at) = self.idle_at {
            if idle_at.elapsed() > keep_alive {
                return false;
            }
        }
        // Data (or EOF) on an idle connection means the peer closed it or is
        // violating the protocol; either way it is done.
        let mut probe = [0u8; 1];
        match self.transport.socket().peek(&mut probe) {
            Ok(_) => false,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.socket().peer_addr().ok()
    }

    /// Read everything currently available, handing each chunk to `sink`.
    /// Returns whether the peer closed its end.
    pub(crate) fn read_available(
        &mut self,
        mut sink: impl FnMut(&[u8]),
    ) -> io::Result<bool> {
        let mut buf = [0u8; 8 * 1024];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => sink(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of `buf` as the socket accepts right now.
    pub(crate) fn write_some(&mut self, buf: &mut BytesMut) -> io::Result<()> {
        while !buf.is_empty() {
            match self.transport.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match self.transport.flush() {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conn")
            .field("token", &self.token)
            .field("transport", &self.transport)
            .field("processed", &self.processed)
            .finish()
    }
}

/// Everything needed to reach one origin.
#[derive(Clone)]
pub(crate) struct DialConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
    pub(crate) proxy: Option<ProxyScheme>,
    pub(crate) connector: Option<Rc<TlsConnector>>,
}

impl DialConfig {
    fn tunneled(&self) -> bool {
        self.tls && self.proxy.is_some()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DialState {
    Connecting,
    TunnelWrite,
    TunnelRead,
    TlsHandshake,
    Done,
}

struct Dialer {
    handle: LoopHandle,
    config: DialConfig,
    deferred: Deferred<ConnCell>,
    addrs: VecDeque<SocketAddr>,
    transport: Option<Transport>,
    token: Option<IoToken>,
    state: DialState,
    write_buf: BytesMut,
    parser: ResponseParser,
    processed: u64,
}

/// Open a connection for `config`, resolving the host on `executor`.
pub(crate) fn dial(
    handle: &LoopHandle,
    executor: &dyn Executor,
    config: DialConfig,
) -> Deferred<ConnCell> {
    let deferred: Deferred<ConnCell> = Deferred::new();

    let (connect_host, connect_port) = match &config.proxy {
        Some(proxy) => (proxy.host.clone(), proxy.port),
        None => (config.host.clone(), config.port),
    };

    let dialer = Rc::new(RefCell::new(Dialer {
        handle: handle.clone(),
        config,
        deferred: deferred.clone(),
        addrs: VecDeque::new(),
        transport: None,
        token: None,
        state: DialState::Connecting,
        write_buf: BytesMut::new(),
        parser: ResponseParser::new(),
        processed: 0,
    }));

    let lookup = dns::resolve(handle, executor, &connect_host, connect_port);
    lookup.add_done_callback(move |result| match result {
        Ok(addrs) => {
            dialer.borrow_mut().addrs = addrs.iter().copied().collect();
            Dialer::try_next_addr(&dialer);
        }
        Err(e) => dialer.borrow().deferred.reject(e.clone()),
    });

    deferred
}

impl Dialer {
    fn try_next_addr(this: &Rc<RefCell<Dialer>>) {
        loop {
            let addr = match this.borrow_mut().addrs.pop_front() {
                Some(addr) => addr,
                None => {
                    let dialer = this.borrow();
                    dialer
                        .deferred
                        .reject(Error::connect(format!(
                            "could not connect to {}:{}",
                            dialer.config.host, dialer.config.port
                        )));
                    return;
                }
            };

            trace!("connecting to {addr}");
            let mut stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("connect to {addr} failed: {e}; trying next address");
                    continue;
                }
            };

            let weak = Rc::downgrade(this);
            let register = this.borrow().handle.register(
                &mut stream,
                Interest::READABLE | Interest::WRITABLE,
                move |readiness| {
                    if let Some(dialer) = weak.upgrade() {
                        Dialer::drive(&dialer, readiness);
                    }
                },
            );
            match register {
                Ok(token) => {
                    let mut dialer = this.borrow_mut();
                    dialer.transport = Some(Transport::Plain(stream));
                    dialer.token = Some(token);
                    dialer.state = DialState::Connecting;
                    return;
                }
                Err(e) => {
                    this.borrow().deferred.reject(e.clone());
                    return;
                }
            }
        }
    }

    fn drive(this: &Rc<RefCell<Dialer>>, readiness: Readiness) {
        let state = this.borrow().state;
        match state {
            DialState::Connecting => Self::drive_connecting(this, readiness),
            DialState::TunnelWrite => Self::drive_tunnel_write(this, readiness),
            DialState::TunnelRead => Self::drive_tunnel_read(this, readiness),
            DialState::TlsHandshake => Self::continue_handshake(this),
            DialState::Done => {}
        }
    }

    fn drive_connecting(this: &Rc<RefCell<Dialer>>, readiness: Readiness) {
        if !readiness.writable && !readiness.readable {
            return;
        }

        // A connect either finished or failed; mio surfaces both as events
        // on the socket. take_error distinguishes them.
        let connect_result = {
            let mut dialer = this.borrow_mut();
            let socket = dialer
                .transport
                .as_mut()
                .expect("connecting without a socket")
                .socket_mut();
            match socket.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                },
            }
        };

        match connect_result {
            Ok(false) => {} // still in flight
            Ok(true) => Self::connected(this),
            Err(e) => {
                debug!("connect failed: {e}; trying next address");
                Self::abandon_socket(this);
                Self::try_next_addr(this);
            }
        }
    }

    fn connected(this: &Rc<RefCell<Dialer>>) {
        let tunneled = this.borrow().config.tunneled();
        if tunneled {
            {
                let mut dialer = this.borrow_mut();
                let connect = dialer.connect_request();
                dialer.write_buf = connect;
                dialer.state = DialState::TunnelWrite;
            }
            Self::drive_tunnel_write(this, Readiness { readable: false, writable: true });
        } else if this.borrow().config.tls {
            this.borrow_mut().state = DialState::TlsHandshake;
            Self::continue_handshake(this);
        } else {
            Self::finish(this);
        }
    }

    fn drive_tunnel_write(this: &Rc<RefCell<Dialer>>, readiness: Readiness) {
        if readiness.writable {
            let result = {
                let mut dialer = this.borrow_mut();
                let mut buf = std::mem::take(&mut dialer.write_buf);
                let transport = dialer.transport.as_mut().expect("tunnel without socket");
                let result = write_plain(transport, &mut buf);
                dialer.write_buf = buf;
                result
            };
            if let Err(e) = result {
                Self::fail(this, Error::connect(e));
                return;
            }
        }

        let flushed = this.borrow().write_buf.is_empty();
        if flushed {
            this.borrow_mut().state = DialState::TunnelRead;
            Self::drive_tunnel_read(this, Readiness { readable: true, writable: false });
        }
    }

    fn drive_tunnel_read(this: &Rc<RefCell<Dialer>>, readiness: Readiness) {
        if !readiness.readable {
            return;
        }

        let read_result = {
            let mut dialer = this.borrow_mut();
            let mut read = [0u8; 4 * 1024];
            loop {
                let n = {
                    let transport = dialer.transport.as_mut().expect("tunnel without socket");
                    match transport.read(&mut read) {
                        Ok(0) => {
                            break Err(Error::connect("proxy closed connection during CONNECT"))
                        }
                        Ok(n) => n,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => break Err(Error::connect(e)),
                    }
                };
                dialer.parser.feed(&read[..n]);
            }
        };
        if let Err(e) = read_result {
            Self::fail(this, e);
            return;
        }

        let head = match this.borrow_mut().parser.parse_head() {
            Ok(head) => head,
            Err(e) => {
                Self::fail(this, e);
                return;
            }
        };
        let Some(head) = head else { return };
        if !head.status.is_success() {
            Self::fail(
                this,
                Error::connect(format!("unsuccessful tunnel ({})", head.status)),
            );
            return;
        }

        trace!("tunnel established, upgrading to tls");
        {
            let mut dialer = this.borrow_mut();
            dialer.processed = 1;
            dialer.state = DialState::TlsHandshake;
        }
        Self::continue_handshake(this);
    }

    fn continue_handshake(this: &Rc<RefCell<Dialer>>) {
        let result = {
            let mut dialer = this.borrow_mut();
            let transport = dialer.transport.take().expect("handshake without socket");
            match transport {
                Transport::Plain(stream) => {
                    let connector = dialer
                        .config
                        .connector
                        .clone()
                        .expect("tls dial without connector");
                    connector.connect(&dialer.config.host, stream)
                }
                Transport::Handshaking(mid) => {
                    mid.expect("handshake stream taken").handshake()
                }
                Transport::Tls(_) => unreachable!("handshake already finished"),
            }
        };

        match result {
            Ok(stream) => {
                this.borrow_mut().transport = Some(Transport::Tls(Box::new(stream)));
                Self::finish(this);
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                this.borrow_mut().transport = Some(Transport::Handshaking(Some(mid)));
            }
            Err(HandshakeError::Failure(e)) => {
                Self::fail(this, Error::tls(e));
            }
        }
    }

    fn finish(this: &Rc<RefCell<Dialer>>) {
        let mut dialer = this.borrow_mut();
        dialer.state = DialState::Done;
        let conn = Conn {
            token: dialer.token.expect("finished dial without token"),
            transport: dialer.transport.take().expect("finished dial without socket"),
            processed: dialer.processed,
            idle_at: None,
        };
        trace!(
            "connected to {}:{} (tls: {})",
            dialer.config.host,
            dialer.config.port,
            conn.transport.is_tls()
        );
        let deferred = dialer.deferred.clone();
        drop(dialer);
        deferred.resolve(cell(conn));
    }

    fn fail(this: &Rc<RefCell<Dialer>>, error: Error) {
        Self::abandon_socket(this);
        let mut dialer = this.borrow_mut();
        dialer.state = DialState::Done;
        let deferred = dialer.deferred.clone();
        drop(dialer);
        deferred.reject(error);
    }

    fn abandon_socket(this: &Rc<RefCell<Dialer>>) {
        let mut dialer = this.borrow_mut();
        if let (Some(mut transport), Some(token)) = (dialer.transport.take(), dialer.token.take())
        {
            if let Err(e) = dialer.handle.deregister(transport.socket_mut(), token) {
                debug!("deregister of abandoned socket failed: {e}");
            }
        }
    }

    fn connect_request(&self) -> BytesMut {
        connect_request(&self.config)
    }
}

fn connect_request(config: &DialConfig) -> BytesMut {
    let authority = format!("{}:{}", config.host, config.port);
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"CONNECT ");
    buf.put_slice(authority.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\nhost: ");
    buf.put_slice(authority.as_bytes());
    buf.put_slice(b"\r\n");
    if let Some(auth) = config.proxy.as_ref().and_then(|p| p.basic_auth.as_ref()) {
        buf.put_slice(b"proxy-authorization: ");
        buf.put_slice(auth.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

fn write_plain(transport: &mut Transport, buf: &mut BytesMut) -> io::Result<()> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// A dial abandoned mid-flight (e.g. its pool closed) must not leave the
// socket registered.
impl Drop for Dialer {
    fn drop(&mut self) {
        if let (Some(mut transport), Some(token)) = (self.transport.take(), self.token.take()) {
            let _ = self.handle.deregister(transport.socket_mut(), token);
        }
    }
}
