pub mod logger;
pub mod record;

pub use logger::{AccessLogDrainer, AccessLogSink, AccessLogger, FileSink, StreamSink};
pub use record::AccessLogRecord;
