use crate::events::dispatcher::init_events;
use crate::events::model::LogLevel;
use crate::events::sink::{ConsoleSink, JsonFileSink, LogSink};
use std::str::FromStr;
use std::sync::Arc;

/// Initialize events with defaults
pub fn init_default_events() -> bool {
    init_events_with_options(None, None)
}

/// Initialize events using optional logging config
pub fn init_events_from_config(logging: Option<&crate::config::LoggingConfig>) -> bool {
    let console_level = logging
        .and_then(|l| l.console_level.as_deref())
        .and_then(|s| LogLevel::from_str(s).ok());
    init_events_with_options(logging, console_level)
}

/// Initialize events using optional logging config and console minimum level filter
pub fn init_events_with_options(
    logging: Option<&crate::config::LoggingConfig>,
    console_min_level: Option<LogLevel>,
) -> bool {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();

    let disable_console = logging.and_then(|l| l.disable_console).unwrap_or(false);
    if !disable_console {
        sinks.push(Arc::new(ConsoleSink::new(
            console_min_level.or(Some(LogLevel::Info)),
        )));
    }

    let json_path = logging
        .and_then(|l| l.json_path.clone())
        .unwrap_or_else(|| "logs/agentlink.jsonl".into());
    let max_bytes = logging
        .and_then(|l| l.json_max_bytes)
        .unwrap_or(5 * 1024 * 1024);
    let rotate = logging.and_then(|l| l.json_rotate).unwrap_or(3);
    match JsonFileSink::new(&json_path, true, max_bytes as u64, rotate) {
        Ok(json_sink) => sinks.push(Arc::new(json_sink)),
        Err(e) => eprintln!("json event log {} disabled: {}", json_path, e),
    }
    init_events(sinks, 1024)
}
