//! End-to-end coverage of half-close: a client that stops reading/writing
//! and closes its side before the origin has replied must not lose the
//! origin's already-buffered reply, and the connection must still drain
//! and log exactly once.

use relayforge::cache::cert_bundle::CertBundle;
use relayforge::certforge::CertForger;
use relayforge::config::{DestinationMode, EngineConfig, ListenerProto, ListenerSpec, ProxyConfig};
use relayforge::error::Result as EngineResult;
use relayforge::filter::PassthroughFilter;
use relayforge::Engine;

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct UnusedForger;

impl CertForger for UnusedForger {
    fn forge(&self, _origin_cert_der: &[u8]) -> EngineResult<CertBundle> {
        unreachable!("no TLS listener in this scenario")
    }

    fn fingerprint(&self, _origin_cert_der: &[u8]) -> [u8; 32] {
        unreachable!("no TLS listener in this scenario")
    }
}

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

#[test]
fn client_half_close_still_delivers_origins_reply() {
    let listen_addr = free_addr();
    let origin_addr = free_addr();

    let origin_listener = TcpListener::bind(origin_addr).unwrap();
    let origin = std::thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"REQUEST\n");
        stream.write_all(b"REPLY\n").unwrap();
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

    std::thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(listen_addr).unwrap();
    client.write_all(b"REQUEST\n").unwrap();
    // Half-close the write side immediately; the origin's reply must still
    // arrive on the read side before the connection tears down.
    client.shutdown(Shutdown::Write).unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"REPLY\n");
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
    assert!(shared.logs.connect.dequeue_nb().is_none(), "connection must be logged exactly once");

    stop.store(true, Ordering::Relaxed);
    runner.join().unwrap();
}
