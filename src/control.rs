//! # Control Channel Module
//!
//! The control channel is a long-lived TCP connection carrying state-change
//! and negotiation messages, distinct from the data streams. The wire format
//! is deliberately small: a one-byte state message, plus length-prefixed
//! JSON blobs for the parameter and result exchanges.
//!
//! [`ControlPlane`] is the seam the driver talks through; [`TcpControl`] is
//! the real implementation. Exactly one pending control message is consumed
//! per call to [`ControlPlane::handle_message`], and control messages take
//! priority over data transfer within a loop iteration (the driver enforces
//! the ordering).

use crate::cli::TestConfig;
use crate::session::{Protocol, StreamSocket, TestSession, TestState, TestStream};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use tracing::debug;

/// Upper bound on a control blob, matching the data-plane message cap.
const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

/// Test parameters sent to the server during the parameter exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestParams {
    pub protocol: Protocol,
    /// Wall-clock limit in seconds, 0 for unlimited.
    pub duration_secs: f64,
    /// Byte limit, 0 for unlimited.
    pub bytes: u64,
    /// Block limit, 0 for unlimited.
    pub blocks: u64,
    pub parallel: usize,
    pub block_size: usize,
    pub reverse: bool,
    /// Warm-up window in seconds, 0 for none.
    pub omit_secs: f64,
    pub client_version: String,
}

impl TestParams {
    pub fn from_session(session: &TestSession) -> Self {
        let config = &session.config;
        Self {
            protocol: session.protocol,
            duration_secs: config.duration.map(|d| d.as_secs_f64()).unwrap_or(0.0),
            bytes: config.bytes.unwrap_or(0),
            blocks: config.blocks.unwrap_or(0),
            parallel: config.parallel,
            block_size: config.block_size,
            reverse: session.reverse,
            omit_secs: config.omit.map(|o| o.as_secs_f64()).unwrap_or(0.0),
            client_version: crate::VERSION.to_string(),
        }
    }
}

/// Per-stream figures included in the end-of-test result exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamResult {
    pub id: usize,
    pub bytes: u64,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Local results sent to the peer once the test has ended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResults {
    pub cpu_util_user: f64,
    pub cpu_util_system: f64,
    pub cpu_util_total: f64,
    pub streams: Vec<StreamResult>,
}

impl TestResults {
    pub fn from_session(session: &TestSession) -> Self {
        let end_secs = match (session.started_at, session.ended_at) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            (Some(start), None) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        };
        let cpu = session.cpu.finish().unwrap_or_default();
        Self {
            cpu_util_user: cpu.user_percent,
            cpu_util_system: cpu.system_percent,
            cpu_util_total: cpu.total_percent,
            streams: session
                .streams
                .iter()
                .map(|s| StreamResult {
                    id: s.id,
                    bytes: s.bytes_transferred,
                    start_secs: 0.0,
                    end_secs,
                })
                .collect(),
        }
    }
}

/// The driver's seam onto the control protocol.
pub trait ControlPlane {
    /// Establish the control channel and, for the client role, prepare for
    /// data-stream creation. Fails fatally; the driver never retries.
    fn connect(&mut self, session: &mut TestSession) -> io::Result<()>;

    /// Consume exactly one pending control message. May mutate the session
    /// state and create data streams; returns the state received so the
    /// driver can react.
    fn handle_message(&mut self, session: &mut TestSession) -> io::Result<TestState>;

    /// Transmit a state-change request and adopt the state locally.
    fn send_state(&mut self, session: &mut TestSession, state: TestState) -> io::Result<()>;
}

/// Real control plane over a TCP connection to the server.
#[derive(Debug, Default)]
pub struct TcpControl {
    server_addr: Option<SocketAddr>,
}

impl TcpControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(config: &TestConfig) -> io::Result<SocketAddr> {
        (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", config.host),
                )
            })
    }

    fn configure_stream(stream: &TcpStream, config: &TestConfig) -> io::Result<()> {
        let sock = SockRef::from(stream);
        if config.no_delay {
            sock.set_nodelay(true)?;
        }
        if let Some(window) = config.window {
            sock.set_recv_buffer_size(window)?;
            sock.set_send_buffer_size(window)?;
        }
        Ok(())
    }

    fn control_stream<'a>(session: &'a mut TestSession) -> io::Result<&'a mut TcpStream> {
        session.control.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "control channel not established")
        })
    }

    fn read_state(stream: &mut TcpStream) -> io::Result<TestState> {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        TestState::from_wire(byte[0] as i8).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown control state byte: {}", byte[0] as i8),
            )
        })
    }

    fn write_blob(stream: &mut TcpStream, value: &serde_json::Value) -> io::Result<()> {
        let body = serde_json::to_vec(value)?;
        let len = body.len() as u32;
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(&body)?;
        stream.flush()
    }

    fn read_blob(stream: &mut TcpStream) -> io::Result<serde_json::Value> {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_BLOB_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control blob too large: {} bytes", len),
            ));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        serde_json::from_slice(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Send the parameter blob in response to the server's request.
    fn exchange_parameters(&self, session: &mut TestSession) -> io::Result<()> {
        let params = serde_json::to_value(TestParams::from_session(session))?;
        let stream = Self::control_stream(session)?;
        Self::write_blob(stream, &params)?;
        debug!("sent test parameters");
        Ok(())
    }

    /// Open the data streams, in creation order, each announcing the session
    /// cookie so the server can associate them.
    fn create_streams(&self, session: &mut TestSession) -> io::Result<()> {
        let addr = self.server_addr.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "server address not resolved")
        })?;
        let cookie = session.cookie.clone();

        for id in 1..=session.config.parallel {
            let socket = match session.protocol {
                Protocol::Tcp => {
                    let mut stream = TcpStream::connect(addr)?;
                    Self::configure_stream(&stream, &session.config)?;
                    stream.write_all(cookie.as_bytes())?;
                    StreamSocket::Tcp(stream)
                }
                Protocol::Udp => {
                    let bind_addr: SocketAddr = if addr.is_ipv4() {
                        "0.0.0.0:0".parse().expect("fixed addr")
                    } else {
                        "[::]:0".parse().expect("fixed addr")
                    };
                    let socket = UdpSocket::bind(bind_addr)?;
                    socket.connect(addr)?;
                    socket.send(cookie.as_bytes())?;
                    StreamSocket::Udp(socket)
                }
            };
            debug!("data stream {} connected to {}", id, addr);
            session.streams.push(TestStream::new(id, socket));
        }
        Ok(())
    }

    /// Swap end-of-test result blobs with the peer.
    fn exchange_results(&self, session: &mut TestSession) -> io::Result<()> {
        let ours = serde_json::to_value(TestResults::from_session(session))?;
        let stream = Self::control_stream(session)?;
        Self::write_blob(stream, &ours)?;
        let theirs = Self::read_blob(stream)?;
        debug!("exchanged results with peer");
        session.peer_results = Some(theirs);
        Ok(())
    }
}

impl ControlPlane for TcpControl {
    fn connect(&mut self, session: &mut TestSession) -> io::Result<()> {
        let addr = Self::resolve(&session.config)?;
        let mut stream = TcpStream::connect(addr)?;
        // The control channel always disables Nagle so one-byte state
        // messages are not delayed behind data.
        SockRef::from(&stream).set_nodelay(true)?;
        self.server_addr = Some(addr);

        stream.write_all(session.cookie.as_bytes())?;
        debug!("control channel connected to {}", addr);
        session.control = Some(stream);
        Ok(())
    }

    fn handle_message(&mut self, session: &mut TestSession) -> io::Result<TestState> {
        let received = {
            let stream = Self::control_stream(session)?;
            Self::read_state(stream)?
        };
        debug!("control message: {:?}", received);

        match received {
            TestState::ParamExchange => {
                session.state = TestState::ParamExchange;
                self.exchange_parameters(session)?;
            }
            TestState::CreateStreams => {
                session.state = TestState::CreateStreams;
                self.create_streams(session)?;
            }
            TestState::TestStart => {
                session.state = TestState::TestStart;
            }
            TestState::TestRunning => {
                session.state = TestState::TestRunning;
            }
            TestState::ExchangeResults => {
                session.state = TestState::ExchangeResults;
                self.exchange_results(session)?;
            }
            TestState::DisplayResults => {
                session.state = TestState::DisplayResults;
            }
            TestState::AccessDenied => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "server busy: access denied",
                ));
            }
            TestState::ServerTerminate | TestState::ServerError => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "server terminated the test",
                ));
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected control state: {:?}", other),
                ));
            }
        }

        Ok(received)
    }

    fn send_state(&mut self, session: &mut TestSession, state: TestState) -> io::Result<()> {
        let byte = state.to_wire().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("state {:?} has no wire encoding", state),
            )
        })?;
        let stream = Self::control_stream(session)?;
        stream.write_all(&[byte as u8])?;
        stream.flush()?;
        session.state = state;
        debug!("sent state change: {:?}", state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::TestConfig;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    fn session_with_control() -> (TestSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut session = TestSession::new(TestConfig::default());
        session.control = Some(client);
        (session, server)
    }

    #[test]
    fn test_send_state_writes_byte_and_adopts_state() {
        let (mut session, mut server) = session_with_control();
        let mut control = TcpControl::new();

        control
            .send_state(&mut session, TestState::TestEnd)
            .unwrap();
        assert_eq!(session.state, TestState::TestEnd);

        let mut byte = [0u8; 1];
        server.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0] as i8, TestState::TestEnd.to_wire().unwrap());
    }

    #[test]
    fn test_param_exchange_sends_blob() {
        let (mut session, mut server) = session_with_control();
        let mut control = TcpControl::new();

        let handle = thread::spawn(move || {
            server
                .write_all(&[TestState::ParamExchange.to_wire().unwrap() as u8])
                .unwrap();
            TcpControl::read_blob(&mut server).unwrap()
        });

        let received = control.handle_message(&mut session).unwrap();
        assert_eq!(received, TestState::ParamExchange);
        assert_eq!(session.state, TestState::ParamExchange);

        let params = handle.join().unwrap();
        assert_eq!(params["parallel"], session.config.parallel);
        assert_eq!(params["reverse"], false);
    }

    #[test]
    fn test_unknown_state_byte_is_fatal() {
        let (mut session, mut server) = session_with_control();
        let mut control = TcpControl::new();

        server.write_all(&[200]).unwrap();
        let err = control.handle_message(&mut session).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_server_terminate_is_fatal() {
        let (mut session, mut server) = session_with_control();
        let mut control = TcpControl::new();

        server
            .write_all(&[TestState::ServerTerminate.to_wire().unwrap() as u8])
            .unwrap();
        assert!(control.handle_message(&mut session).is_err());
    }

    #[test]
    fn test_blob_round_trip() {
        let (mut session, mut server) = session_with_control();
        let value = serde_json::json!({"answer": 42});
        TcpControl::write_blob(session.control.as_mut().unwrap(), &value).unwrap();
        let read = TcpControl::read_blob(&mut server).unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn test_results_capture_stream_bytes() {
        let config = TestConfig::default();
        let mut session = TestSession::new(config);
        session.started_at = Some(Instant::now());
        session.ended_at = session.started_at;

        let results = TestResults::from_session(&session);
        assert!(results.streams.is_empty());
        assert!(results.cpu_util_total >= 0.0);
    }
}
