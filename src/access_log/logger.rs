//! Asynchronous access-log pipeline.
//!
//! Records go onto a bounded queue drained by a single writer task. The
//! request path never blocks on the sink: when the queue is full the oldest
//! record is dropped and a warning is emitted at most once per second.
use std::{
    collections::VecDeque,
    io::Write as _,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tokio::sync::Notify;

use crate::access_log::record::AccessLogRecord;

const QUEUE_DEPTH: usize = 128;
const DROP_WARN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Destination for rendered access-log lines.
#[async_trait]
pub trait AccessLogSink: Send {
    async fn write_line(&mut self, line: &str);
}

/// Appends lines to a file.
pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    pub fn open(path: &str) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open access log file {path}"))?;
        Ok(Self { file })
    }
}

#[async_trait]
impl AccessLogSink for FileSink {
    async fn write_line(&mut self, line: &str) {
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            tracing::error!(error = %e, "failed to write access log record");
        }
    }
}

/// Emits each record on the structured log stream.
pub struct StreamSink;

#[async_trait]
impl AccessLogSink for StreamSink {
    async fn write_line(&mut self, line: &str) {
        tracing::info!(target: "access_log", "{}", line.trim_end());
    }
}

struct Shared {
    queue: Mutex<VecDeque<AccessLogRecord>>,
    notify: Notify,
    closed: AtomicBool,
    last_drop_warning: Mutex<Option<Instant>>,
}

/// Cloneable producer handle for the access-log queue.
#[derive(Clone)]
pub struct AccessLogger {
    shared: Arc<Shared>,
}

impl AccessLogger {
    /// Create the producer handle and its single-consumer drainer.
    pub fn new(sinks: Vec<Box<dyn AccessLogSink>>) -> (Self, AccessLogDrainer) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_DEPTH)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            last_drop_warning: Mutex::new(None),
        });
        (
            Self {
                shared: shared.clone(),
            },
            AccessLogDrainer { shared, sinks },
        )
    }

    /// A logger with no sinks; records are queued and discarded. Handy for
    /// tests and for configurations with logging disabled.
    pub fn disabled() -> Self {
        AccessLogger::new(Vec::new()).0
    }

    /// Enqueue one record. When the queue is full the oldest record gives
    /// way so recent traffic stays observable.
    pub fn log(&self, record: AccessLogRecord) {
        {
            let mut queue = self.shared.queue.lock().expect("access log queue poisoned");
            if queue.len() >= QUEUE_DEPTH {
                queue.pop_front();
                self.warn_dropped();
            }
            queue.push_back(record);
        }
        self.shared.notify.notify_one();
    }

    fn warn_dropped(&self) {
        let mut last = self
            .shared
            .last_drop_warning
            .lock()
            .expect("drop warning lock poisoned");
        let now = Instant::now();
        let due = last.map_or(true, |t| now.duration_since(t) >= DROP_WARN_INTERVAL);
        if due {
            *last = Some(now);
            tracing::warn!("access log queue full, dropping oldest record");
        }
    }

    /// Stop the drainer once the queue is empty.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

/// The single consumer draining the queue into the sinks.
pub struct AccessLogDrainer {
    shared: Arc<Shared>,
    sinks: Vec<Box<dyn AccessLogSink>>,
}

impl AccessLogDrainer {
    pub async fn run(mut self) {
        loop {
            let record = {
                let mut queue = self.shared.queue.lock().expect("access log queue poisoned");
                queue.pop_front()
            };

            match record {
                Some(record) => {
                    let line = record.to_line();
                    for sink in &mut self.sinks {
                        sink.write_line(&line).await;
                    }
                }
                None => {
                    if self.shared.closed.load(Ordering::Acquire) {
                        return;
                    }
                    self.shared.notify.notified().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingSink {
        lines: Arc<Mutex<Vec<String>>>,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AccessLogSink for CountingSink {
        async fn write_line(&mut self, line: &str) {
            self.lines
                .lock()
                .unwrap()
                .push(line.to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(host: &str) -> AccessLogRecord {
        AccessLogRecord {
            host: host.to_string(),
            method: "GET".to_string(),
            uri: "/".to_string(),
            http_version: "HTTP/1.1".to_string(),
            status: 200,
            ..AccessLogRecord::default()
        }
    }

    #[tokio::test]
    async fn drains_records_to_every_sink() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            lines: lines.clone(),
            count: count.clone(),
        };

        let (logger, drainer) = AccessLogger::new(vec![Box::new(sink)]);
        logger.log(record("a"));
        logger.log(record("b"));
        logger.close();
        drainer.run().await;

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("a - "));
        assert!(lines[1].starts_with("b - "));
        assert!(lines.iter().all(|l| l.ends_with('\n')));
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest_record() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            lines: lines.clone(),
            count: count.clone(),
        };

        let (logger, drainer) = AccessLogger::new(vec![Box::new(sink)]);
        for i in 0..(QUEUE_DEPTH + 5) {
            logger.log(record(&format!("host-{i}")));
        }
        logger.close();
        drainer.run().await;

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), QUEUE_DEPTH);
        // The first five records were displaced.
        assert!(lines[0].starts_with("host-5 "));
        assert!(lines.last().unwrap().starts_with(&format!(
            "host-{} ",
            QUEUE_DEPTH + 4
        )));
    }

    #[tokio::test]
    async fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let path = path.to_str().unwrap().to_string();

        let sink = FileSink::open(&path).unwrap();
        let (logger, drainer) = AccessLogger::new(vec![Box::new(sink)]);
        logger.log(record("filehost"));
        logger.close();
        drainer.run().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("filehost - "));
        assert!(contents.ends_with('\n'));
    }
}
