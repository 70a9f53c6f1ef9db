//! Session egress - writes completed payment sessions to file
//!
//! Sessions are written in JSONL format (one JSON object per line)
//! to the file specified in config, for reconciliation against the
//! hopper and cash-box contents.

use crate::domain::session_record::SessionRecord;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for session records
pub struct SessionEgress {
    file_path: String,
    site_id: String,
}

impl SessionEgress {
    pub fn new(file_path: &str, site_id: &str) -> Self {
        info!(file_path = %file_path, "session_egress_initialized");
        Self { file_path: file_path.to_string(), site_id: site_id.to_string() }
    }

    /// Write a session record to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_record(&self, record: &SessionRecord) -> bool {
        let json = record.to_json_with_site(&self.site_id);

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    sid = %record.sid,
                    outcome = %record.outcome.as_str(),
                    collected = %record.collected(),
                    change_out = %record.change_dispensed,
                    "session_egressed"
                );
                true
            }
            Err(e) => {
                error!(sid = %record.sid, error = %e, "session_egress_failed");
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session_record::{SessionEvent, SessionEventType, SessionOutcome};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_write_record() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sessions.jsonl");
        let file_str = file_path.to_str().unwrap();

        let egress = SessionEgress::new(file_str, "kiosk-7");

        let mut record = SessionRecord::new(42);
        record.coin_total = 45;
        record.change_requested = 3;
        record.change_dispensed = 3;
        record.add_event(SessionEvent::new(SessionEventType::Coin).with_amount(10));
        record.complete(SessionOutcome::Completed, "Change dispensed: 3");

        assert!(egress.write_record(&record));

        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["sid"], record.sid);
        assert_eq!(parsed["site"], "kiosk-7");
        assert_eq!(parsed["collected"], 45);
        assert_eq!(parsed["out"], "completed");
    }

    #[test]
    fn test_append_mode() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sessions.jsonl");
        let file_str = file_path.to_str().unwrap();

        let egress = SessionEgress::new(file_str, "kiosk");

        let mut first = SessionRecord::new(50);
        first.complete(SessionOutcome::Completed, "");
        let mut second = SessionRecord::new(20);
        second.complete(SessionOutcome::Cancelled, "refund 20");
        egress.write_record(&first);
        egress.write_record(&second);

        let content = fs::read_to_string(&file_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let _parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("sessions.jsonl");
        let egress = SessionEgress::new(nested.to_str().unwrap(), "kiosk");

        let mut record = SessionRecord::new(10);
        record.complete(SessionOutcome::Completed, "");

        assert!(egress.write_record(&record));
        assert!(nested.exists());
    }
}
