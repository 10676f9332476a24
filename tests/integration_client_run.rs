//! End-to-end client runs against an in-process peer speaking the real
//! control protocol over loopback.

mod common;

use netload::{execute, CancelToken, TestConfig};
use std::time::Duration;

fn config_for(port: u16) -> TestConfig {
    TestConfig {
        host: "127.0.0.1".to_string(),
        port,
        block_size: 8 * 1024,
        structured: true,
        ..TestConfig::default()
    }
}

#[test]
fn test_duration_limited_run_produces_full_report() {
    let server = common::FakeServer::spawn();
    let config = TestConfig {
        duration: Some(Duration::from_millis(300)),
        interval: Some(Duration::from_millis(100)),
        ..config_for(server.port)
    };

    let outcome = execute(config, CancelToken::new());

    assert_eq!(outcome.status, 0);
    assert!(outcome.report.error.is_empty());
    assert!(outcome.report.start.contains_key("connecting_to"));
    assert!(outcome.report.start.contains_key("test_start"));
    assert!(outcome.report.end["seconds"].as_f64().unwrap() > 0.0);

    // Periodic reports were appended in order as they became available.
    assert!(!outcome.report.intervals.is_empty());
    for pair in outcome.report.intervals.windows(2) {
        assert!(pair[0].end_secs <= pair[1].end_secs);
    }

    // The peer's results made it into the final summary.
    assert!(outcome.report.end.contains_key("peer"));

    let summary = server.join();
    assert!(summary.bytes_received > 0);
    assert!(summary.client_results.is_object());
}

#[test]
fn test_byte_limited_run_sends_at_least_the_limit() {
    let server = common::FakeServer::spawn();
    let config = TestConfig {
        duration: None,
        bytes: Some(64 * 1024),
        interval: None,
        ..config_for(server.port)
    };

    let outcome = execute(config, CancelToken::new());
    assert_eq!(outcome.status, 0);
    assert!(outcome.report.error.is_empty());

    let summary = server.join();
    assert!(summary.bytes_received >= 64 * 1024);
}

#[test]
fn test_parallel_streams_all_carry_data() {
    let server = common::FakeServer::spawn();
    let config = TestConfig {
        duration: None,
        bytes: Some(128 * 1024),
        interval: None,
        parallel: 2,
        ..config_for(server.port)
    };

    let outcome = execute(config, CancelToken::new());
    assert_eq!(outcome.status, 0);

    let streams = outcome.report.end["streams"].as_array().unwrap().clone();
    assert_eq!(streams.len(), 2);

    let summary = server.join();
    assert!(summary.bytes_received >= 128 * 1024);
}
