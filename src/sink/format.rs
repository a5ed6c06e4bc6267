//! Audit line formatting.

use crate::error::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

/// `chrono` format string for the audit timestamp (local time).
pub const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// How audit lines are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuditFormat {
    /// `Topic: <topic>, Time: <time>, Message: <message>`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// One audited publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub topic: String,
    pub time: String,
    pub message: String,
}

impl AuditRecord {
    /// Capture a publish at the current local time.
    pub fn now(topic: &str, message: String) -> Self {
        Self {
            topic: topic.to_string(),
            time: Local::now().format(TIME_FORMAT).to_string(),
            message,
        }
    }
}

impl AuditFormat {
    /// Render a record as a newline-terminated line.
    pub fn render(&self, record: &AuditRecord) -> Result<Vec<u8>> {
        match self {
            AuditFormat::Text => Ok(format!(
                "Topic: {}, Time: {}, Message: {}\n",
                record.topic, record.time, record.message
            )
            .into_bytes()),
            AuditFormat::Json => {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                Ok(line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuditRecord {
        AuditRecord {
            topic: "orders".to_string(),
            time: "2024/01/02 03:04:05".to_string(),
            message: "A".to_string(),
        }
    }

    #[test]
    fn test_text_line() {
        let line = AuditFormat::Text.render(&record()).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "Topic: orders, Time: 2024/01/02 03:04:05, Message: A\n"
        );
    }

    #[test]
    fn test_json_line() {
        let line = AuditFormat::Json.render(&record()).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let parsed: AuditRecord = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed, record());
    }

    #[test]
    fn test_now_uses_time_format() {
        let rec = AuditRecord::now("x", 42.to_string());
        assert_eq!(rec.message, "42");
        // yyyy/mm/dd hh:mm:ss
        assert_eq!(rec.time.len(), 19);
        assert_eq!(&rec.time[4..5], "/");
        assert_eq!(&rec.time[13..14], ":");
    }
}
