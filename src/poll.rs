//! # Readiness Multiplexer Module
//!
//! Per-iteration readiness snapshots for the driver loop. Each pass the
//! driver asks which of a bounded set of descriptors (one control channel,
//! N data streams) are ready, waiting at most until the next timer deadline.
//! The snapshot is recomputed every iteration; nothing persists between
//! calls.
//!
//! The wait must return on descriptor readiness, timeout expiry, or signal
//! interruption. Interruption is surfaced as `io::ErrorKind::Interrupted`
//! and the driver retries it transparently; it is never a failure.

use crate::session::TestSession;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::time::Duration;

/// Which registered descriptors are ready this iteration.
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    /// The control channel has a pending message.
    pub control: bool,
    /// Stream indices ready for reading.
    pub read_ready: Vec<usize>,
    /// Stream indices ready for writing.
    pub write_ready: Vec<usize>,
}

impl Readiness {
    /// A snapshot with nothing ready (timeout expiry).
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        !self.control && self.read_ready.is_empty() && self.write_ready.is_empty()
    }
}

/// The driver's suspension point: a bounded wait for I/O readiness.
pub trait ReadinessSource {
    /// Wait until any registered descriptor of `session` is ready or
    /// `timeout` elapses (`None` waits indefinitely).
    fn wait(&mut self, session: &TestSession, timeout: Option<Duration>) -> io::Result<Readiness>;
}

/// `poll(2)`-backed readiness source used for real runs.
#[derive(Debug, Default)]
pub struct PollMultiplexer;

impl PollMultiplexer {
    pub fn new() -> Self {
        Self
    }

    fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
        match timeout {
            None => PollTimeout::NONE,
            Some(d) if d.is_zero() => PollTimeout::ZERO,
            // Sub-millisecond waits round up so a pending deadline is not
            // spun on; out-of-range waits clamp to the maximum.
            Some(d) => PollTimeout::try_from(d.max(Duration::from_millis(1)))
                .unwrap_or(PollTimeout::MAX),
        }
    }
}

impl ReadinessSource for PollMultiplexer {
    fn wait(&mut self, session: &TestSession, timeout: Option<Duration>) -> io::Result<Readiness> {
        let mut fds = Vec::with_capacity(1 + session.streams.len());
        let control_registered = session.control.is_some();

        if let Some(control) = &session.control {
            use std::os::fd::AsFd;
            fds.push(PollFd::new(control.as_fd(), PollFlags::POLLIN));
        }

        // Streams are polled in the direction the test moves data: reverse
        // mode receives, regular mode sends.
        let stream_events = if session.reverse {
            PollFlags::POLLIN
        } else {
            PollFlags::POLLOUT
        };
        for stream in &session.streams {
            fds.push(PollFd::new(stream.socket.as_fd(), stream_events));
        }

        match poll(&mut fds, Self::poll_timeout(timeout)) {
            Ok(0) => return Ok(Readiness::idle()),
            Ok(_) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }

        let mut readiness = Readiness::idle();
        let mut iter = fds.iter();

        if control_registered {
            if let Some(control_fd) = iter.next() {
                let revents = control_fd.revents().unwrap_or(PollFlags::empty());
                readiness.control = revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP);
            }
        }

        for (idx, fd) in iter.enumerate() {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            // Errors and hangups surface as readiness so the stream I/O call
            // observes and classifies them.
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP) {
                readiness.read_ready.push(idx);
            }
            if revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP) {
                readiness.write_ready.push(idx);
            }
        }

        Ok(readiness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::TestConfig;
    use crate::session::{StreamSocket, TestStream};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_idle_snapshot() {
        let readiness = Readiness::idle();
        assert!(readiness.is_idle());
    }

    #[test]
    fn test_timeout_expiry_returns_idle() {
        let (client, _server) = connected_pair();
        let mut session = TestSession::new(TestConfig::default());
        session.control = Some(client);

        let mut mux = PollMultiplexer::new();
        let readiness = mux
            .wait(&session, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(!readiness.control);
    }

    #[test]
    fn test_control_readable_after_peer_write() {
        let (client, mut server) = connected_pair();
        let mut session = TestSession::new(TestConfig::default());
        session.control = Some(client);

        server.write_all(&[1]).unwrap();

        let mut mux = PollMultiplexer::new();
        let readiness = mux
            .wait(&session, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(readiness.control);
    }

    #[test]
    fn test_stream_write_readiness() {
        let (control_a, _control_b) = connected_pair();
        let (data_a, _data_b) = connected_pair();

        let mut session = TestSession::new(TestConfig::default());
        session.control = Some(control_a);
        session
            .streams
            .push(TestStream::new(1, StreamSocket::Tcp(data_a)));

        let mut mux = PollMultiplexer::new();
        let readiness = mux
            .wait(&session, Some(Duration::from_secs(5)))
            .unwrap();
        // A fresh TCP stream with an empty send buffer is write-ready.
        assert_eq!(readiness.write_ready, vec![0]);
    }
}
