use std::net::SocketAddr;
use std::time::Duration;

use crate::events::{
    dispatcher,
    model::{ConnectionRole, HandshakeEvent, LogEvent, LogLevel, NetworkEvent, TaskEvent},
};

/// Emit a structured network event.
pub(crate) fn emit_network_event(
    component: &'static str,
    level: LogLevel,
    action: &str,
    addr: Option<String>,
    detail: Option<String>,
) {
    let mut meta = dispatcher::meta(component, level);
    meta.corr_id = Some(dispatcher::correlation_id());
    dispatcher::emit(LogEvent::Network(NetworkEvent {
        meta,
        action: action.to_string(),
        addr,
        detail,
    }));
}

pub(crate) struct HandshakeReport<'a> {
    pub role: ConnectionRole,
    pub peer: SocketAddr,
    pub fingerprint: Option<String>,
    pub protocol: Option<String>,
    pub elapsed: Duration,
    pub failure: Option<&'a str>,
}

pub(crate) fn emit_handshake_event(report: HandshakeReport<'_>) {
    let level = if report.failure.is_some() {
        LogLevel::Warn
    } else {
        LogLevel::Info
    };
    let mut meta = dispatcher::meta("handshake", level);
    meta.corr_id = Some(dispatcher::correlation_id());
    dispatcher::emit(LogEvent::Handshake(HandshakeEvent {
        meta,
        role: report.role,
        peer_addr: report.peer.to_string(),
        success: report.failure.is_none(),
        fingerprint: report.fingerprint,
        protocol: report.protocol,
        elapsed_ms: report.elapsed.as_millis(),
        reason: report.failure.map(str::to_string),
    }));
}

pub(crate) fn emit_task_event(
    level: LogLevel,
    action: &str,
    task: &str,
    peer: Option<SocketAddr>,
    detail: Option<String>,
) {
    let meta = dispatcher::meta("worker", level);
    dispatcher::emit(LogEvent::Task(TaskEvent {
        meta,
        action: action.to_string(),
        task: task.to_string(),
        peer_addr: peer.map(|p| p.to_string()),
        detail,
    }));
}
