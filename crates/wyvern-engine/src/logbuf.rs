//! Bounded in-memory log capture feeding the log dump server.
//!
//! [`LogBuffer`] is a fixed-capacity FIFO of formatted log lines: when full,
//! the oldest line is evicted so producers never block and never fail.
//! [`BufferingLogger`] installs as the global `log` backend, forwards every
//! record to an inner [`env_logger::Logger`] for normal stderr output, and
//! tees the records that pass the filter into a shared buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Lines kept before the oldest is dropped.
pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 15_000;

/// Fixed-capacity FIFO of formatted log lines.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest if the buffer is full.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Remove and return up to `max` lines, oldest first.
    pub fn drain(&self, max: usize) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap();
        let take = max.min(lines.len());
        lines.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_CAPACITY)
    }
}

/// Global logger that writes to stderr through `env_logger` and mirrors
/// filtered records into a [`LogBuffer`].
pub struct BufferingLogger {
    inner: env_logger::Logger,
    buffer: Arc<LogBuffer>,
}

impl BufferingLogger {
    /// Install as the global logger, honoring `RUST_LOG` with an `info`
    /// default. Returns the buffer to hand to the log dump server.
    ///
    /// Fails if a global logger is already set.
    pub fn init() -> Result<Arc<LogBuffer>, log::SetLoggerError> {
        Self::init_from_env(env_logger::Env::default().default_filter_or("info"))
    }

    pub fn init_from_env(env: env_logger::Env) -> Result<Arc<LogBuffer>, log::SetLoggerError> {
        let inner = env_logger::Builder::from_env(env).build();
        let buffer = Arc::new(LogBuffer::default());
        let max_level = inner.filter();
        log::set_boxed_logger(Box::new(BufferingLogger {
            inner,
            buffer: buffer.clone(),
        }))?;
        log::set_max_level(max_level);
        Ok(buffer)
    }
}

impl log::Log for BufferingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.matches(record) {
            self.buffer.push(format!(
                "{} [{}] {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn full_buffer_evicts_oldest() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line-{i}"));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.drain(10), ["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn drain_is_oldest_first_and_capped() {
        let buf = LogBuffer::default();
        for i in 0..60 {
            buf.push(format!("line-{i}"));
        }

        let first = buf.drain(50);
        assert_eq!(first.len(), 50);
        assert_eq!(first[0], "line-0");
        assert_eq!(first[49], "line-49");

        let rest = buf.drain(50);
        assert_eq!(rest.len(), 10);
        assert_eq!(rest[0], "line-50");
        assert!(buf.is_empty());
    }

    #[test]
    fn concurrent_pushes_never_exceed_capacity() {
        let buf = Arc::new(LogBuffer::new(100));
        let mut handles = Vec::new();
        for t in 0..4 {
            let buf = buf.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    buf.push(format!("t{t}-{i}"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn logger_tees_matching_records_into_the_buffer() {
        let inner = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .build();
        let buffer = Arc::new(LogBuffer::new(10));
        let logger = BufferingLogger {
            inner,
            buffer: buffer.clone(),
        };

        log::Log::log(
            &logger,
            &log::Record::builder()
                .args(format_args!("pool starting"))
                .level(log::Level::Info)
                .target("wyvern_engine::engine")
                .build(),
        );
        log::Log::log(
            &logger,
            &log::Record::builder()
                .args(format_args!("too chatty"))
                .level(log::Level::Debug)
                .target("wyvern_engine::engine")
                .build(),
        );

        let lines = buffer.drain(10);
        assert_eq!(lines, ["INFO [wyvern_engine::engine] pool starting"]);
    }
}
