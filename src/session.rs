//! # Test Session Module
//!
//! The [`TestSession`] aggregate is the central piece of state for a single
//! throughput test run. It is created by the caller, mutated exclusively by
//! the driver for the duration of the run, and torn down by the caller after
//! the driver returns. The driver guarantees the session is left in a
//! terminal, consistent state on every exit path, including error paths.
//!
//! The module also contains the small closed set of protocol and state
//! variants the driver dispatches on, and the completion evaluator
//! ([`TestLimits`]) that decides each iteration whether the stopping
//! condition has been reached.

use crate::cli::TestConfig;
use crate::metrics::CpuTracker;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Which side of the test this process is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

/// Data-plane protocol kind.
///
/// A closed two-case variant: connection-oriented (TCP) streams have their
/// blocking mode toggled by the driver, datagram (UDP) sockets never do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Whether the protocol carries a stream the driver may switch between
    /// blocking and non-blocking mode.
    pub fn is_connection_oriented(&self) -> bool {
        matches!(self, Protocol::Tcp)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Test lifecycle states.
///
/// `Created` exists only locally; every other variant has a one-byte wire
/// encoding used on the control channel. The error pseudo-state is realized
/// as the driver's error return plus a populated diagnostic string, not as a
/// variant here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestState {
    /// Session constructed, control channel not yet established.
    Created,
    TestStart,
    TestRunning,
    TestEnd,
    ParamExchange,
    CreateStreams,
    ServerTerminate,
    ClientTerminate,
    ExchangeResults,
    DisplayResults,
    Done,
    AccessDenied,
    ServerError,
}

impl TestState {
    /// Wire encoding of the state byte, `None` for local-only states.
    pub fn to_wire(self) -> Option<i8> {
        match self {
            TestState::Created => None,
            TestState::TestStart => Some(1),
            TestState::TestRunning => Some(2),
            TestState::TestEnd => Some(4),
            TestState::ParamExchange => Some(9),
            TestState::CreateStreams => Some(10),
            TestState::ServerTerminate => Some(11),
            TestState::ClientTerminate => Some(12),
            TestState::ExchangeResults => Some(13),
            TestState::DisplayResults => Some(14),
            TestState::Done => Some(16),
            TestState::AccessDenied => Some(-1),
            TestState::ServerError => Some(-2),
        }
    }

    /// Decode a state byte received on the control channel.
    pub fn from_wire(byte: i8) -> Option<TestState> {
        match byte {
            1 => Some(TestState::TestStart),
            2 => Some(TestState::TestRunning),
            4 => Some(TestState::TestEnd),
            9 => Some(TestState::ParamExchange),
            10 => Some(TestState::CreateStreams),
            11 => Some(TestState::ServerTerminate),
            12 => Some(TestState::ClientTerminate),
            13 => Some(TestState::ExchangeResults),
            14 => Some(TestState::DisplayResults),
            16 => Some(TestState::Done),
            -1 => Some(TestState::AccessDenied),
            -2 => Some(TestState::ServerError),
            _ => None,
        }
    }

    /// Whether data streams are actively driven in this state.
    pub fn is_running(self) -> bool {
        matches!(self, TestState::TestRunning)
    }

    /// Whether the test has passed its end-of-measurement transition.
    ///
    /// Peer-initiated stream closes are non-fatal once this is true.
    pub fn is_ending(self) -> bool {
        matches!(
            self,
            TestState::TestEnd
                | TestState::ExchangeResults
                | TestState::DisplayResults
                | TestState::Done
        )
    }
}

/// Stopping-condition limits. Zero or `None` means "unlimited along that
/// axis"; at most one axis is expected to be authoritative in practice.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TestLimits {
    /// Wall-clock limit, enforced by the duration timer setting `done`.
    pub duration: Option<Duration>,
    /// Byte-count limit on sent payload.
    pub bytes: Option<u64>,
    /// Block-count limit on sent payload blocks.
    pub blocks: Option<u64>,
}

impl TestLimits {
    /// Completion evaluator: any satisfied condition ends the test.
    ///
    /// Callers must not consult this while the warm-up (omitting) window is
    /// active; the driver enforces that.
    pub fn reached(&self, done: bool, bytes_sent: u64, blocks_sent: u64) -> bool {
        if self.duration.is_some() && done {
            return true;
        }
        if let Some(limit) = self.bytes {
            if limit > 0 && bytes_sent >= limit {
                return true;
            }
        }
        if let Some(limit) = self.blocks {
            if limit > 0 && blocks_sent >= limit {
                return true;
            }
        }
        false
    }
}

/// Data-plane socket, one of the two supported kinds.
#[derive(Debug)]
pub enum StreamSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl StreamSocket {
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            StreamSocket::Tcp(s) => s.as_fd(),
            StreamSocket::Udp(s) => s.as_fd(),
        }
    }
}

/// A single data-plane connection, owned by its session and never shared.
///
/// The blocking-mode flag is controlled exclusively by the driver.
#[derive(Debug)]
pub struct TestStream {
    pub id: usize,
    pub socket: StreamSocket,
    /// Current blocking mode as last set by the driver.
    pub nonblocking: bool,
    /// Payload bytes moved through this stream.
    pub bytes_transferred: u64,
}

impl TestStream {
    pub fn new(id: usize, socket: StreamSocket) -> Self {
        Self {
            id,
            socket,
            nonblocking: false,
            bytes_transferred: 0,
        }
    }

    /// Switch the underlying socket between blocking and non-blocking mode.
    pub fn set_nonblocking(&mut self, on: bool) -> io::Result<()> {
        match &self.socket {
            StreamSocket::Tcp(s) => s.set_nonblocking(on)?,
            StreamSocket::Udp(s) => s.set_nonblocking(on)?,
        }
        self.nonblocking = on;
        Ok(())
    }

    /// Write one payload block, returning the number of bytes accepted.
    pub fn write_block(&mut self, block: &[u8]) -> io::Result<usize> {
        match &mut self.socket {
            StreamSocket::Tcp(s) => s.write(block),
            StreamSocket::Udp(s) => s.send(block),
        }
    }

    /// Read into a scratch buffer, returning the number of bytes received.
    pub fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.socket {
            StreamSocket::Tcp(s) => s.read(buf),
            StreamSocket::Udp(s) => s.recv(buf),
        }
    }
}

/// The central test aggregate.
///
/// Single owner for the duration of the run is the driver; no other actor
/// mutates it concurrently, so no internal locking is used. Exactly one
/// control channel exists per session and is created before the run loop is
/// entered. The stream set is fixed in membership once the test is running.
#[derive(Debug)]
pub struct TestSession {
    pub config: TestConfig,
    pub role: Role,
    pub protocol: Protocol,
    pub limits: TestLimits,
    pub state: TestState,

    /// Session identifier, sent on the control channel and on every data
    /// stream at connect time.
    pub cookie: String,

    // Counters, monotonically non-decreasing while the test is running
    // (restarted once when the warm-up window ends).
    pub bytes_sent: u64,
    pub blocks_sent: u64,
    pub bytes_received: u64,
    pub blocks_received: u64,

    // Flags
    pub reverse: bool,
    pub omitting: bool,
    pub done: bool,
    pub verbose: bool,

    /// Control channel, exactly one, never replaced once established.
    pub control: Option<TcpStream>,
    /// Ordered data streams; insertion order is creation order.
    pub streams: Vec<TestStream>,

    /// Human-readable diagnostic, empty on success.
    pub error: String,
    /// Peer's end-of-test result blob, captured during result exchange.
    pub peer_results: Option<serde_json::Value>,

    /// CPU-utilization tracker (baseline at connect, final at test end).
    pub cpu: CpuTracker,
    /// Measurement start, set when the test-start message is handled.
    pub started_at: Option<Instant>,
    /// Measurement end, set on the completion transition.
    pub ended_at: Option<Instant>,
}

impl TestSession {
    /// Build a client-role session from a validated configuration.
    pub fn new(config: TestConfig) -> Self {
        let limits = TestLimits {
            duration: config.duration,
            bytes: config.bytes,
            blocks: config.blocks,
        };
        Self {
            role: Role::Client,
            protocol: config.protocol,
            limits,
            state: TestState::Created,
            cookie: Uuid::new_v4().to_string(),
            bytes_sent: 0,
            blocks_sent: 0,
            bytes_received: 0,
            blocks_received: 0,
            reverse: config.reverse,
            omitting: config.omit.is_some(),
            done: false,
            verbose: config.verbose,
            control: None,
            streams: Vec::new(),
            error: String::new(),
            peer_results: None,
            cpu: CpuTracker::default(),
            started_at: None,
            ended_at: None,
            config,
        }
    }

    /// Total payload bytes moved in either direction.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    /// Restart the counters when the warm-up window ends, so steady-state
    /// statistics exclude the omitted traffic.
    pub fn restart_counters(&mut self) {
        self.bytes_sent = 0;
        self.blocks_sent = 0;
        self.bytes_received = 0;
        self.blocks_received = 0;
        for stream in &mut self.streams {
            stream.bytes_transferred = 0;
        }
    }

    /// Seconds elapsed since measurement start, zero before it.
    pub fn elapsed_secs(&self, now: Instant) -> f64 {
        match self.started_at {
            Some(start) => now.duration_since(start).as_secs_f64(),
            None => 0.0,
        }
    }

    /// Whether any stream is still in non-blocking mode.
    pub fn has_nonblocking_streams(&self) -> bool {
        self.streams.iter().any(|s| s.nonblocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(duration: Option<u64>, bytes: Option<u64>, blocks: Option<u64>) -> TestLimits {
        TestLimits {
            duration: duration.map(Duration::from_secs),
            bytes,
            blocks,
        }
    }

    #[test]
    fn test_state_wire_round_trip() {
        let states = [
            TestState::TestStart,
            TestState::TestRunning,
            TestState::TestEnd,
            TestState::ParamExchange,
            TestState::CreateStreams,
            TestState::ServerTerminate,
            TestState::ClientTerminate,
            TestState::ExchangeResults,
            TestState::DisplayResults,
            TestState::Done,
            TestState::AccessDenied,
            TestState::ServerError,
        ];
        for state in states {
            let byte = state.to_wire().unwrap();
            assert_eq!(TestState::from_wire(byte), Some(state));
        }
        assert_eq!(TestState::Created.to_wire(), None);
        assert_eq!(TestState::from_wire(99), None);
    }

    #[test]
    fn test_duration_limit_requires_done_flag() {
        let l = limits(Some(10), None, None);
        assert!(!l.reached(false, u64::MAX, u64::MAX));
        assert!(l.reached(true, 0, 0));
    }

    #[test]
    fn test_byte_limit() {
        let l = limits(None, Some(1000), None);
        assert!(!l.reached(false, 999, 0));
        assert!(l.reached(false, 1000, 0));
        assert!(l.reached(false, 1001, 0));
    }

    #[test]
    fn test_block_limit() {
        let l = limits(None, None, Some(10));
        assert!(!l.reached(false, 0, 9));
        assert!(l.reached(false, 0, 10));
    }

    #[test]
    fn test_unlimited_never_completes() {
        let l = limits(None, None, None);
        assert!(!l.reached(false, u64::MAX, u64::MAX));
        // A stray done flag without a duration limit does not complete either.
        assert!(!l.reached(true, 0, 0));
    }

    #[test]
    fn test_first_satisfied_limit_wins() {
        let l = limits(Some(10), Some(1000), Some(50));
        assert!(l.reached(false, 1000, 0));
        assert!(l.reached(false, 0, 50));
        assert!(l.reached(true, 0, 0));
    }

    #[test]
    fn test_protocol_orientation() {
        assert!(Protocol::Tcp.is_connection_oriented());
        assert!(!Protocol::Udp.is_connection_oriented());
    }

    #[test]
    fn test_session_counter_restart() {
        let config = TestConfig::default();
        let mut session = TestSession::new(config);
        session.bytes_sent = 500;
        session.blocks_sent = 5;
        session.bytes_received = 100;
        session.restart_counters();
        assert_eq!(session.bytes_sent, 0);
        assert_eq!(session.blocks_sent, 0);
        assert_eq!(session.bytes_received, 0);
    }
}
