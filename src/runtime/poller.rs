use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token};

/// Token 0 is reserved for the waker that interrupts `select` from other
/// threads; real registrations start at 1.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Readiness state delivered to an I/O callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The source is (probably) ready for reading; also set on errors and
    /// peer half-closes, which surface through the subsequent read.
    pub readable: bool,
    /// The source is (probably) ready for writing.
    pub writable: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Readiness {
        // Errors and half-closes surface as readability: the subsequent
        // read/write reports the real io::Error.
        Readiness {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }

    /// Neither readable nor writable.
    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Readiness notification over file descriptors.
///
/// A thin seam over `mio::Poll`: registrations go through the [`Registry`]
/// handed out at construction, `select` blocks for at most `timeout` and
/// reports `(token, readiness)` pairs, and the waker wakes a blocked `select`
/// from another thread.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub(crate) fn new() -> io::Result<(Poller, Registry, mio::Waker)> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        Ok((
            Poller {
                poll,
                events: Events::with_capacity(256),
            },
            registry,
            waker,
        ))
    }

    /// Block for at most `timeout` and collect readiness events.
    ///
    /// Waker events are consumed here; only real registrations are returned.
    pub(crate) fn select(
        &mut self,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<(Token, Readiness)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut out = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let readiness = Readiness::from_event(event);
            if !readiness.is_empty() {
                out.push((event.token(), readiness));
            }
        }
        Ok(out)
    }
}
