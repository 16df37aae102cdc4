//! End-to-end coverage of the passthrough TCP relay scenario: a plain TCP
//! client talks to the listener, the engine relays bytes to and from the
//! configured origin untouched, and exactly one CONN record is emitted with
//! byte counts split correctly by direction.

use relayforge::cache::cert_bundle::CertBundle;
use relayforge::certforge::CertForger;
use relayforge::config::{DestinationMode, EngineConfig, ListenerProto, ListenerSpec, ProxyConfig};
use relayforge::error::Result as EngineResult;
use relayforge::filter::PassthroughFilter;
use relayforge::Engine;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Never consulted by a plain TCP listener; only satisfies `Engine::start`'s
/// signature.
struct UnusedForger;

impl CertForger for UnusedForger {
    fn forge(&self, _origin_cert_der: &[u8]) -> EngineResult<CertBundle> {
        unreachable!("no TLS listener in this scenario")
    }

    fn fingerprint(&self, _origin_cert_der: &[u8]) -> [u8; 32] {
        unreachable!("no TLS listener in this scenario")
    }
}

/// Binds an ephemeral port, reads the address, then releases it so a
/// listener bound moments later can reuse it. Small window for a collision;
/// acceptable for a single-threaded local test run.
fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

fn start_engine(listen_addr: SocketAddr, origin_addr: SocketAddr) -> Engine {
    let config = ProxyConfig {
        listeners: vec![ListenerSpec {
            proto: ListenerProto::Tcp,
            listen_addr,
            destination: DestinationMode::Static(origin_addr),
            sni_port: None,
            divert_addr: None,
            return_addr: None,
            divert: false,
        }],
        engine: EngineConfig { worker_threads: Some(1), ..Default::default() },
        ..Default::default()
    };
    Engine::start(config, Arc::new(UnusedForger), Arc::new(PassthroughFilter)).unwrap()
}

/// Pulls `in=` and `out=` fields out of a rendered `CONN:` log line.
fn parse_byte_counts(line: &str) -> (u64, u64) {
    let mut in_bytes = None;
    let mut out_bytes = None;
    for field in line.split_whitespace() {
        if let Some(v) = field.strip_prefix("in=") {
            in_bytes = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("out=") {
            out_bytes = v.parse().ok();
        }
    }
    (in_bytes.expect("in= field present"), out_bytes.expect("out= field present"))
}

#[test]
fn passthrough_tcp_relay_logs_once_with_split_byte_counts() {
    let listen_addr = free_addr();
    let origin_addr = free_addr();

    let origin_listener = TcpListener::bind(origin_addr).unwrap();
    let origin = std::thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING\n");
        stream.write_all(b"PONG\n").unwrap();
    });

    let engine = start_engine(listen_addr, origin_addr);
    let shared = engine.shared.clone();

    let stop = Arc::new(AtomicBool::new(false));
    let run_stop = stop.clone();
    let runner = std::thread::spawn(move || {
        let mut engine = engine;
        engine.run(&EngineConfig::default(), move || run_stop.load(Ordering::Relaxed)).unwrap();
        engine.shutdown();
    });

    // The listener is already bound inside `Engine::start`; give the accept
    // loop a moment to start polling before dialing in.
    std::thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(listen_addr).unwrap();
    client.write_all(b"PING\n").unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"PONG\n");
    drop(client);

    origin.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let record = loop {
        if let Some(record) = shared.logs.connect.dequeue_nb() {
            break record;
        }
        assert!(Instant::now() < deadline, "timed out waiting for the CONN record");
        std::thread::sleep(Duration::from_millis(10));
    };

    let line = String::from_utf8(record.bytes).unwrap();
    assert!(line.starts_with("CONN:"), "unexpected log line shape: {line}");
    let (in_bytes, out_bytes) = parse_byte_counts(&line);
    assert_eq!(in_bytes, 5, "client->proxy bytes: {line}");
    assert_eq!(out_bytes, 5, "proxy->client bytes: {line}");

    assert!(shared.logs.connect.dequeue_nb().is_none(), "connection must be logged exactly once");

    stop.store(true, Ordering::Relaxed);
    runner.join().unwrap();
}
