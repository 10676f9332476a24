//! Shared test helpers: a minimal in-process peer that plays the server
//! side of the control protocol against a real client run.

use serde_json::Value;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const COOKIE_LEN: usize = 36;

const TEST_START: u8 = 1;
const TEST_RUNNING: u8 = 2;
const TEST_END: u8 = 4;
const PARAM_EXCHANGE: u8 = 9;
const CREATE_STREAMS: u8 = 10;
const CLIENT_TERMINATE: u8 = 12;
const EXCHANGE_RESULTS: u8 = 13;
const DISPLAY_RESULTS: u8 = 14;

/// What the peer observed over the whole exchange.
pub struct PeerSummary {
    /// Payload bytes drained from the data streams.
    pub bytes_received: u64,
    /// The client's end-of-test result blob, `Null` if the client
    /// terminated early.
    pub client_results: Value,
}

/// Handle to the peer thread.
pub struct FakeServer {
    pub port: u16,
    handle: JoinHandle<io::Result<PeerSummary>>,
}

impl FakeServer {
    /// Bind a listener and play the server role on a background thread.
    pub fn spawn() -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind peer listener");
        let port = listener.local_addr().expect("local addr").port();
        let handle = thread::spawn(move || run_peer(listener));
        FakeServer { port, handle }
    }

    pub fn join(self) -> PeerSummary {
        self.handle
            .join()
            .expect("peer thread panicked")
            .expect("peer protocol error")
    }
}

fn send_state(control: &mut TcpStream, state: u8) -> io::Result<()> {
    control.write_all(&[state])?;
    control.flush()
}

fn write_blob(control: &mut TcpStream, value: &Value) -> io::Result<()> {
    let body = serde_json::to_vec(value)?;
    control.write_all(&(body.len() as u32).to_be_bytes())?;
    control.write_all(&body)?;
    control.flush()
}

fn read_blob(control: &mut TcpStream) -> io::Result<Value> {
    let mut len_bytes = [0u8; 4];
    control.read_exact(&mut len_bytes)?;
    let mut body = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
    control.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn run_peer(listener: TcpListener) -> io::Result<PeerSummary> {
    let (mut control, _) = listener.accept()?;
    control.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut cookie = [0u8; COOKIE_LEN];
    control.read_exact(&mut cookie)?;

    // Parameter exchange, then data-stream creation.
    send_state(&mut control, PARAM_EXCHANGE)?;
    let params = read_blob(&mut control)?;
    let parallel = params["parallel"].as_u64().unwrap_or(1) as usize;

    send_state(&mut control, CREATE_STREAMS)?;
    let mut drains = Vec::with_capacity(parallel);
    for _ in 0..parallel {
        let (mut data, _) = listener.accept()?;
        drains.push(thread::spawn(move || -> u64 {
            let mut cookie = [0u8; COOKIE_LEN];
            if data.read_exact(&mut cookie).is_err() {
                return 0;
            }
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0u64;
            loop {
                match data.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n as u64,
                }
            }
            total
        }));
    }

    send_state(&mut control, TEST_START)?;
    send_state(&mut control, TEST_RUNNING)?;

    // The client drives the end of the test: a regular end or an early
    // terminate.
    let mut state = [0u8; 1];
    control.read_exact(&mut state)?;

    let mut client_results = Value::Null;
    match state[0] {
        TEST_END => {
            send_state(&mut control, EXCHANGE_RESULTS)?;
            client_results = read_blob(&mut control)?;
            write_blob(
                &mut control,
                &serde_json::json!({
                    "cpu_util_user": 0.0,
                    "cpu_util_system": 0.0,
                    "cpu_util_total": 0.0,
                    "streams": [],
                }),
            )?;
            send_state(&mut control, DISPLAY_RESULTS)?;
            // The client acknowledges with its final state byte.
            let _ = control.read_exact(&mut state);
        }
        CLIENT_TERMINATE => {}
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected client state byte: {}", other),
            ));
        }
    }
    drop(control);

    let bytes_received = drains.into_iter().map(|d| d.join().unwrap_or(0)).sum();
    Ok(PeerSummary {
        bytes_received,
        client_results,
    })
}
