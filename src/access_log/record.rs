//! Access log records.
//!
//! One record per request, built incrementally over the request's life and
//! rendered as a single positional, space-separated line. Quoted fields are
//! the request line, referer and user-agent; labelled suffixes carry the
//! request id, response time and app identity. Absent values render `-`.
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, Clone, Default)]
pub struct AccessLogRecord {
    pub host: String,
    pub started_at: Option<DateTime<Utc>>,
    pub method: String,
    /// Path + query exactly as received, percent-encoding intact.
    pub uri: String,
    pub http_version: String,
    pub status: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub backend_addr: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub vcap_request_id: Option<String>,
    /// Seconds, set when the response completes.
    pub response_time: Option<f64>,
    pub application_id: Option<String>,
    pub app_index: Option<String>,
    /// `(lowercased_underscored_name, value)` pairs for the configured
    /// extra headers, in configuration order.
    pub extra_headers: Vec<(String, String)>,
}

fn or_dash(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

impl AccessLogRecord {
    /// Render the record as its log line, newline-terminated.
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(256);

        let timestamp = self
            .started_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| "-".to_string());

        let _ = write!(
            line,
            "{} - [{}] \"{} {} {}\" {} {} {} \"{}\" \"{}\" {} {}",
            self.host,
            timestamp,
            self.method,
            self.uri,
            self.http_version,
            self.status,
            self.request_bytes,
            self.response_bytes,
            or_dash(&self.referer),
            or_dash(&self.user_agent),
            or_dash(&self.client_ip),
            or_dash(&self.backend_addr),
        );

        let _ = write!(
            line,
            " x_forwarded_for:\"{}\" vcap_request_id:{}",
            or_dash(&self.x_forwarded_for),
            or_dash(&self.vcap_request_id),
        );

        match self.response_time {
            Some(t) => {
                let _ = write!(line, " response_time:{t:.9}");
            }
            None => line.push_str(" response_time:-"),
        }

        let _ = write!(
            line,
            " app_id:{} app_index:{}",
            or_dash(&self.application_id),
            or_dash(&self.app_index),
        );

        for (name, value) in &self.extra_headers {
            let _ = write!(line, " {name}:\"{value}\"");
        }

        line.push('\n');
        line
    }

    /// The configured extra-header label for a header name:
    /// `Content-Type` logs as `content_type`.
    pub fn extra_header_label(header: &str) -> String {
        header.to_ascii_lowercase().replace('-', "_")
    }
}
