use crate::events::model::{EventMeta, LogEvent, LogLevel, SystemEvent};
use crate::events::sink::LogSink;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use uuid::Uuid;

static DISPATCHER: OnceCell<EventDispatcher> = OnceCell::new();

pub struct EventDispatcher {
    pub tx: mpsc::Sender<LogEvent>,
    pub session_id: String,
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
}

/// Lightweight handle exposed to consumers so they can emit events or
/// register additional sinks without touching internal locks.
#[derive(Clone)]
pub struct EventHandle;

impl EventHandle {
    pub fn emit(&self, event: LogEvent) {
        super::dispatcher::emit(event);
    }
    pub fn register_sink(&self, sink: Arc<dyn LogSink>) {
        if let Some(d) = EventDispatcher::global() {
            d.register_sink(sink);
        }
    }
    pub fn correlation_id(&self) -> String {
        correlation_id()
    }
    pub fn session_id(&self) -> Option<String> {
        EventDispatcher::global().map(|d| d.session_id.clone())
    }
}

impl EventDispatcher {
    pub fn global() -> Option<&'static EventDispatcher> {
        DISPATCHER.get()
    }
    pub fn register_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks.write().push(sink);
    }
    fn fan_out(&self, event: &LogEvent) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.handle(event);
        }
    }
}

/// Install the global dispatcher. Events are fanned out to `sinks` on a
/// dedicated thread; a second call keeps the first dispatcher and returns false.
pub fn init_events(sinks: Vec<Arc<dyn LogSink>>, capacity: usize) -> bool {
    let (tx, mut rx) = mpsc::channel::<LogEvent>(capacity.max(1));
    let dispatcher = EventDispatcher {
        tx,
        session_id: Uuid::new_v4().to_string(),
        sinks: RwLock::new(sinks),
    };
    if DISPATCHER.set(dispatcher).is_err() {
        return false;
    }
    let spawned = std::thread::Builder::new()
        .name("agentlink-events".into())
        .spawn(move || {
            while let Some(evt) = rx.blocking_recv() {
                if let Some(d) = EventDispatcher::global() {
                    d.fan_out(&evt);
                }
            }
        });
    if let Err(e) = spawned {
        eprintln!("failed to start event dispatcher thread: {}", e);
        return false;
    }
    true
}

pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

pub fn meta(component: &'static str, level: LogLevel) -> EventMeta {
    let session_id = EventDispatcher::global()
        .map(|d| d.session_id.clone())
        .unwrap_or_else(|| "unknown".into());
    EventMeta {
        ts: SystemTime::now(),
        level,
        corr_id: None,
        session_id,
        component,
    }
}

/// Queue an event for the sinks. Dropped when the dispatcher is not
/// initialized or its queue is full; never blocks the caller.
pub fn emit(event: LogEvent) {
    if let Some(d) = EventDispatcher::global() {
        let _ = d.tx.try_send(event);
    }
}

pub fn emit_system_event(component: &'static str, level: LogLevel, action: &str, detail: Option<String>) {
    let mut meta = meta(component, level);
    meta.corr_id = Some(correlation_id());
    emit(LogEvent::System(SystemEvent {
        meta,
        action: action.to_string(),
        detail,
    }));
}

pub fn handle() -> EventHandle {
    EventHandle
}
