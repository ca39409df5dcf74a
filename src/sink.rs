use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::model::{Fields, NormalizedRecord, Tags};

/// Receiver of normalized records. Called once per record, possibly from
/// several scrape pipelines at the same time.
pub trait Sink: Send + Sync {
    fn add_fields(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for std::sync::Arc<S> {
    fn add_fields(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError> {
        (**self).add_fields(measurement, fields, tags, timestamp)
    }
}

/// Forwards records over a channel to whoever owns the receiving end.
impl Sink for mpsc::UnboundedSender<NormalizedRecord> {
    fn add_fields(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError> {
        self.send(NormalizedRecord {
            measurement: measurement.to_string(),
            tags,
            fields,
            timestamp,
        })
        .map_err(|_| SinkError {
            measurement: measurement.to_string(),
            reason: "send error".into(),
        })
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct Accumulator {
    records: Mutex<Vec<NormalizedRecord>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<NormalizedRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn has_field(&self, measurement: &str, field: &str) -> bool {
        self.lock()
            .iter()
            .any(|r| r.measurement == measurement && r.fields.contains_key(field))
    }

    pub fn has_tag(&self, measurement: &str, tag: &str) -> bool {
        self.lock()
            .iter()
            .any(|r| r.measurement == measurement && r.tags.contains_key(tag))
    }

    /// Value of `tag` on the first record of `measurement`.
    pub fn tag_value(&self, measurement: &str, tag: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|r| r.measurement == measurement)
            .and_then(|r| r.tags.get(tag).cloned())
    }

    pub fn has_timestamp(&self, measurement: &str, timestamp: DateTime<Utc>) -> bool {
        self.lock()
            .iter()
            .any(|r| r.measurement == measurement && r.timestamp == Some(timestamp))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<NormalizedRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Sink for Accumulator {
    fn add_fields(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError> {
        self.lock().push(NormalizedRecord {
            measurement: measurement.to_string(),
            tags,
            fields,
            timestamp,
        });
        Ok(())
    }
}

/// Writes records as influx line protocol, one line per record. Records
/// without a timestamp are stamped with the time they are written, records
/// without a finite field are dropped.
#[derive(Debug)]
pub struct LineProtocolSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> LineProtocolSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> Sink for LineProtocolSink<W> {
    fn add_fields(
        &self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError> {
        let line = match format_line(measurement, &fields, &tags, timestamp.unwrap_or_else(Utc::now)) {
            Some(line) => line,
            None => {
                tracing::debug!("dropping {}: no finite field", measurement);
                return Ok(());
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(out, "{}", line).map_err(|e| SinkError {
            measurement: measurement.to_string(),
            reason: e.to_string(),
        })
    }
}

fn escape(s: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `None` when no field is finite, line protocol needs at least one.
pub fn format_line(
    measurement: &str,
    fields: &Fields,
    tags: &Tags,
    timestamp: DateTime<Utc>,
) -> Option<String> {
    let mut line = escape(measurement, &[',', ' ']);
    for (key, value) in tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape(key, &[',', '=', ' ']));
        line.push('=');
        line.push_str(&escape(value, &[',', '=', ' ']));
    }

    let fields: Vec<String> = fields
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| format!("{}={}", escape(k, &[',', '=', ' ']), v))
        .collect();
    if fields.is_empty() {
        return None;
    }
    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&timestamp.timestamp_nanos_opt().unwrap_or_default().to_string());
    Some(line)
}
