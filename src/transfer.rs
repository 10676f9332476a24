//! # Stream Multiplexer Module
//!
//! One round of data-plane I/O per driver iteration. Given the readiness
//! snapshot, the send round writes one payload block to every write-ready
//! stream and the receive round drains every read-ready stream. A stream
//! reporting "would block" is skipped for the iteration; a peer close is
//! fatal only while the test is still measuring.
//!
//! The multiplexer also owns blocking-mode toggling: the driver switches
//! connection-oriented streams to non-blocking exactly once at the first
//! running iteration and back exactly once at completion. Datagram sockets
//! never change mode.

use crate::poll::Readiness;
use crate::session::TestSession;
use rand::RngCore;
use std::io;
use tracing::{debug, trace};

/// The driver's seam onto per-iteration data transfer.
pub trait DataPlane {
    /// Write one block to every write-ready stream, updating the session's
    /// sent counters.
    fn send_round(&mut self, session: &mut TestSession, ready: &Readiness) -> io::Result<()>;

    /// Read from every read-ready stream, updating the session's received
    /// counters.
    fn receive_round(&mut self, session: &mut TestSession, ready: &Readiness) -> io::Result<()>;

    /// Toggle blocking mode on every stream. The driver only calls this for
    /// connection-oriented protocols.
    fn set_streams_nonblocking(&mut self, session: &mut TestSession, on: bool) -> io::Result<()>;
}

/// Real data plane operating on the session's sockets.
pub struct SocketDataPlane {
    /// Payload block written per send, filled once with random bytes.
    block: Vec<u8>,
    /// Scratch buffer for receive rounds.
    scratch: Vec<u8>,
}

impl SocketDataPlane {
    pub fn new(block_size: usize) -> Self {
        let mut block = vec![0u8; block_size];
        rand::thread_rng().fill_bytes(&mut block);
        Self {
            scratch: vec![0u8; block_size],
            block,
        }
    }

    /// Classify an I/O error for a single stream: skip, tolerate, or fail.
    fn stream_error(session: &TestSession, err: io::Error) -> Option<io::Error> {
        match err.kind() {
            // Non-fatal; this stream simply makes no progress this round.
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => None,
            // A peer close is expected once the test is winding down.
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
                if session.state.is_ending() =>
            {
                debug!("stream closed by peer during shutdown: {}", err);
                None
            }
            _ => Some(err),
        }
    }
}

impl DataPlane for SocketDataPlane {
    fn send_round(&mut self, session: &mut TestSession, ready: &Readiness) -> io::Result<()> {
        for &idx in &ready.write_ready {
            if idx >= session.streams.len() {
                continue;
            }
            match session.streams[idx].write_block(&self.block) {
                Ok(0) => {
                    if !session.state.is_ending() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "stream accepted no data",
                        ));
                    }
                }
                Ok(n) => {
                    session.streams[idx].bytes_transferred += n as u64;
                    session.bytes_sent += n as u64;
                    session.blocks_sent += 1;
                    trace!("stream {} sent {} bytes", session.streams[idx].id, n);
                }
                Err(err) => {
                    if let Some(err) = Self::stream_error(session, err) {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn receive_round(&mut self, session: &mut TestSession, ready: &Readiness) -> io::Result<()> {
        for &idx in &ready.read_ready {
            if idx >= session.streams.len() {
                continue;
            }
            match session.streams[idx].read_block(&mut self.scratch) {
                Ok(0) => {
                    // End of stream; fatal only while still measuring.
                    if !session.state.is_ending() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed by peer mid-test",
                        ));
                    }
                }
                Ok(n) => {
                    session.streams[idx].bytes_transferred += n as u64;
                    session.bytes_received += n as u64;
                    session.blocks_received += 1;
                    trace!("stream {} received {} bytes", session.streams[idx].id, n);
                }
                Err(err) => {
                    if let Some(err) = Self::stream_error(session, err) {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn set_streams_nonblocking(&mut self, session: &mut TestSession, on: bool) -> io::Result<()> {
        for stream in &mut session.streams {
            stream.set_nonblocking(on)?;
        }
        debug!(
            "streams switched to {} mode",
            if on { "non-blocking" } else { "blocking" }
        );
        Ok(())
    }
}
