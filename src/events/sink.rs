use crate::events::model::{LogEvent, LogLevel};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

pub trait LogSink: Send + Sync {
    fn handle(&self, event: &LogEvent);
    fn flush(&self) {}
}

pub struct ConsoleSink {
    level_filter: Option<LogLevel>,
}

impl ConsoleSink {
    pub fn new(level_filter: Option<LogLevel>) -> Self {
        Self { level_filter }
    }
}

impl LogSink for ConsoleSink {
    fn handle(&self, event: &LogEvent) {
        let meta = event.meta();
        if let Some(min) = self.level_filter {
            if meta.level < min {
                return;
            }
        }
        match event {
            LogEvent::Network(n) => {
                println!(
                    "[{:?}] NET {} action={} addr={:?} detail={:?} corr={:?}",
                    n.meta.level, n.meta.component, n.action, n.addr, n.detail, n.meta.corr_id
                );
            }
            LogEvent::Handshake(h) => {
                println!(
                    "[{:?}] TLS role={:?} peer={} ok={} fp={:?} proto={:?} ms={} reason={:?}",
                    h.meta.level,
                    h.role,
                    h.peer_addr,
                    h.success,
                    h.fingerprint,
                    h.protocol,
                    h.elapsed_ms,
                    h.reason
                );
            }
            LogEvent::Task(t) => {
                println!(
                    "[{:?}] TASK action={} task={} peer={:?} detail={:?}",
                    t.meta.level, t.action, t.task, t.peer_addr, t.detail
                );
            }
            LogEvent::System(s) => {
                println!(
                    "[{:?}] SYS {} action={} detail={:?} corr={:?}",
                    s.meta.level, s.meta.component, s.action, s.detail, s.meta.corr_id
                );
            }
        }
    }
}

pub struct JsonFileSink {
    path: PathBuf,
    rotate: bool,
    max_size_bytes: u64,
    max_backups: u32,
    writer: Mutex<Option<File>>,
}

impl JsonFileSink {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        rotate: bool,
        max_size_bytes: u64,
        max_backups: u32,
    ) -> std::io::Result<Self> {
        let pb = path.into();
        if let Some(parent) = pb.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new().create(true).append(true).open(&pb)?;
        Ok(Self {
            path: pb,
            rotate,
            max_size_bytes,
            max_backups,
            writer: Mutex::new(Some(file)),
        })
    }

    fn rotate_if_needed(&self, guard: &mut Option<File>) {
        if !self.rotate {
            return;
        }
        if let Ok(meta) = std::fs::metadata(&self.path) {
            if meta.len() >= self.max_size_bytes {
                let _ = self.perform_rotation(guard);
            }
        }
    }

    fn perform_rotation(&self, guard: &mut Option<File>) -> std::io::Result<()> {
        *guard = None;
        if self.max_backups == 0 {
            std::fs::remove_file(&self.path)?;
        } else {
            let oldest = self.path.with_extension(format!("jsonl.{}", self.max_backups));
            if oldest.exists() {
                std::fs::remove_file(&oldest)?;
            }
            self.shift_backups();
            std::fs::rename(&self.path, self.path.with_extension("jsonl.1"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        *guard = Some(file);
        Ok(())
    }

    fn shift_backups(&self) {
        for idx in (1..self.max_backups).rev() {
            let from = self.path.with_extension(format!("jsonl.{}", idx));
            let to = self.path.with_extension(format!("jsonl.{}", idx + 1));
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
    }
}

impl LogSink for JsonFileSink {
    fn handle(&self, event: &LogEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let mut guard = self.writer.lock();
            self.rotate_if_needed(&mut guard);
            if let Some(f) = guard.as_mut() {
                let _ = f.write_all(json.as_bytes());
                let _ = f.write_all(b"\n");
            }
        }
    }

    fn flush(&self) {
        let guard = self.writer.lock();
        if let Some(f) = guard.as_ref() {
            let _ = f.sync_all();
        }
    }
}
