use serde::Serialize;
use std::str::FromStr;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub ts: SystemTime,
    pub level: LogLevel,
    pub corr_id: Option<String>,
    pub session_id: String,
    pub component: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub meta: EventMeta,
    pub action: String,
    pub addr: Option<String>,
    pub detail: Option<String>,
}

/// Outcome of a TLS handshake, inbound or outbound.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeEvent {
    pub meta: EventMeta,
    pub role: ConnectionRole,
    pub peer_addr: String,
    pub success: bool,
    /// SHA-256 SPKI fingerprint of the peer leaf certificate
    pub fingerprint: Option<String>,
    pub protocol: Option<String>,
    pub elapsed_ms: u128,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub meta: EventMeta,
    pub action: String,
    pub task: String,
    pub peer_addr: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub meta: EventMeta,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Network(NetworkEvent),
    Handshake(HandshakeEvent),
    Task(TaskEvent),
    System(SystemEvent),
}

impl LogEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            LogEvent::Network(e) => &e.meta,
            LogEvent::Handshake(e) => &e.meta,
            LogEvent::Task(e) => &e.meta,
            LogEvent::System(e) => &e.meta,
        }
    }
}
