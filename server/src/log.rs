//! Binary audit trail of transfer broker decisions.
//!
//! Events emitted with target [`TARGET`] are captured by
//! [`TransferLogLayer`] and appended to a file as bincode records, which
//! `print_logs` turns back into text.
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use bincode::{Decode, Encode, config, encode_into_std_write};
use chrono::DateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::errors::LogError;

pub const TARGET: &str = "transfer";

#[derive(Encode, Decode, Debug, Default, Clone, PartialEq)]
pub struct TransferLogRecord {
    pub timestamp_ms: i64,
    pub kind: String,
    pub id: u32,
    pub session: u64,
    pub sender: String,
    pub receiver: String,
    pub path: String,
}

#[derive(Debug, Default)]
struct RecordVisitor {
    record: TransferLogRecord,
}

impl RecordVisitor {
    fn set_str(&mut self, field: &Field, value: String) {
        match field.name() {
            "kind" => self.record.kind = value,
            "sender" => self.record.sender = value,
            "receiver" => self.record.receiver = value,
            "path" => self.record.path = value,
            _ => {}
        }
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set_str(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set_str(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "id" => self.record.id = value as u32,
            "session" => self.record.session = value,
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if value >= 0 {
            self.record_u64(field, value as u64);
        }
    }
}

pub struct TransferLogLayer(Option<Mutex<File>>);

impl TransferLogLayer {
    pub fn new(file: Option<File>) -> Self {
        Self(file.map(Mutex::new))
    }
}

impl<S: Subscriber> Layer<S> for TransferLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(ref lock) = self.0 else {
            return;
        };
        if event.metadata().target() != TARGET {
            return;
        }
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        visitor.record.timestamp_ms = chrono::Utc::now().timestamp_millis();
        // Reporting through tracing from inside a layer would recurse.
        let Ok(mut file) = lock.lock() else {
            return;
        };
        if encode_into_std_write(visitor.record, &mut *file, config::standard()).is_ok() {
            let _ = file.flush();
        }
    }
}

/// Decode every record in the log at `path`. A record cut short is an error.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<TransferLogRecord>, LogError> {
    let mut src = BufReader::new(File::open(path).map_err(LogError::Open)?);
    let mut records = vec![];
    while !src.fill_buf().map_err(LogError::Read)?.is_empty() {
        let record: TransferLogRecord =
            bincode::decode_from_std_read(&mut src, config::standard()).map_err(LogError::Decode)?;
        records.push(record);
    }
    Ok(records)
}

pub fn print_logs(path: impl AsRef<Path>, mut out: impl Write) -> Result<(), LogError> {
    for record in read_records(path)? {
        let time = DateTime::from_timestamp_millis(record.timestamp_ms)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| record.timestamp_ms.to_string());
        writeln!(
            out,
            "{time} {:<9} id={:<4} session={:<3} {} -> {} {}",
            record.kind, record.id, record.session, record.sender, record.receiver, record.path
        )
        .map_err(LogError::Write)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;
    use tracing_subscriber::prelude::*;

    #[test]
    fn only_transfer_events_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.bin");
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let subscriber = tracing_subscriber::registry().with(TransferLogLayer::new(Some(file)));
        tracing::subscriber::with_default(subscriber, || {
            info!(
                target: TARGET,
                kind = "accepted",
                id = 3u32,
                session = 1usize,
                sender = "alice",
                receiver = "bob",
                path = "/srv/alice/f.txt"
            );
            info!(kind = "ignored", "not a transfer");
        });

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.kind, "accepted");
        assert_eq!((record.id, record.session), (3, 1));
        assert_eq!(record.sender, "alice");
        assert_eq!(record.receiver, "bob");
        assert!(record.timestamp_ms > 0);

        let mut out = Vec::new();
        print_logs(&path, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("accepted"));
        assert!(text.contains("alice -> bob /srv/alice/f.txt"));
    }

    #[test]
    fn truncated_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.bin");
        std::fs::write(&path, [5u8, b'a']).unwrap();
        assert!(matches!(read_records(&path), Err(LogError::Decode(_))));
    }
}
