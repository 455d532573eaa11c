// tests/events.rs
// The global dispatcher can be installed once per process, so everything that
// needs it lives in a single test.

mod common;

use std::sync::Arc;

use agentlink::events::{
    emit_system_event, init_events, JsonFileSink, LogEvent, LogLevel, LogSink,
};
use agentlink::{Client, Server, TaskType};
use common::{next_of, permissive_provider, recorder, settings, wait_until, WAIT};
use parking_lot::Mutex;

#[derive(Default)]
struct Capture(Mutex<Vec<LogEvent>>);

impl LogSink for Capture {
    fn handle(&self, event: &LogEvent) {
        self.0.lock().push(event.clone());
    }
}

impl Capture {
    fn has_system(&self, action: &str) -> bool {
        self.0
            .lock()
            .iter()
            .any(|e| matches!(e, LogEvent::System(s) if s.action == action))
    }

    fn has_network(&self, action: &str) -> bool {
        self.0
            .lock()
            .iter()
            .any(|e| matches!(e, LogEvent::Network(n) if n.action == action))
    }

    fn successful_handshakes(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| matches!(e, LogEvent::Handshake(h) if h.success && h.fingerprint.is_some()))
            .count()
    }
}

#[test]
fn transport_activity_reaches_sinks() {
    let capture = Arc::new(Capture::default());
    let sinks: Vec<Arc<dyn LogSink>> = vec![capture.clone()];
    assert!(init_events(sinks, 1024));
    assert!(!init_events(Vec::new(), 16));

    emit_system_event("test", LogLevel::Info, "hello_event", Some("hello".into()));
    assert!(wait_until(WAIT, || capture.has_system("hello_event")));

    let (server_factory, server_rx) = recorder();
    let server = Server::new(
        "127.0.0.1:0".parse().unwrap(),
        permissive_provider(),
        server_factory,
        settings(),
    );
    let addr = server.start().unwrap();
    assert!(wait_until(WAIT, || capture.has_system("trust_any_peer")));
    assert!(wait_until(WAIT, || capture.has_network("listener_bind")));

    let client = Client::new("127.0.0.1", addr.port(), permissive_provider(), recorder().0, settings());
    let conn = client.start().unwrap();
    assert!(next_of(&server_rx, TaskType::Connect, WAIT).is_some());
    assert!(wait_until(WAIT, || capture.successful_handshakes() >= 2));
    assert!(wait_until(WAIT, || capture.has_network("connection_registered")));

    conn.close().unwrap();
    assert!(next_of(&server_rx, TaskType::Disconnect, WAIT).is_some());
    assert!(wait_until(WAIT, || capture.has_network("connection_terminated")));
}

#[test]
fn json_sink_writes_lines_and_rotates() {
    let dir = common::scratch("json-sink");
    let path = dir.join("events.jsonl");
    let sink = JsonFileSink::new(&path, true, 200, 2).unwrap();
    let event = LogEvent::System(agentlink::events::SystemEvent {
        meta: agentlink::events::meta("test", LogLevel::Info),
        action: "rotation_check".into(),
        detail: Some("x".repeat(80)),
    });
    for _ in 0..10 {
        sink.handle(&event);
    }
    sink.flush();

    let current = std::fs::read_to_string(&path).unwrap();
    for line in current.lines() {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["type"], "system");
        assert_eq!(parsed["action"], "rotation_check");
    }
    assert!(dir.join("events.jsonl.1").exists());
    assert!(dir.join("events.jsonl.2").exists());
    assert!(!dir.join("events.jsonl.3").exists());
}
