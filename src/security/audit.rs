//! Audit logger: one structured log line, and optionally one JSON line
//! appended to a file, per OPC UA write the Control Manager performs.

use crate::types::AasValue;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Serialize)]
struct AuditEntry {
    timestamp: String,
    event_type: &'static str,
    node_id: String,
    user_id: String,
    previous_value: Value,
    new_value: Value,
    correlation_id: Option<String>,
}

fn serialize_value(value: Option<&AasValue>) -> Value {
    match value {
        None => Value::Null,
        Some(AasValue::Bool(v)) => Value::Bool(*v),
        Some(AasValue::Integer(v)) => (*v).into(),
        Some(AasValue::Float(v)) => {
            serde_json::Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null)
        }
        Some(AasValue::String(v)) => Value::String(v.clone()),
        Some(AasValue::Bytes(v)) => Value::String(format!("<bytes:{}>", v.len())),
        Some(AasValue::DateTime(v)) => Value::String(v.to_rfc3339()),
    }
}

/// Writes the bridge's write-back trail: who wrote what, to which node,
/// overwriting what previous value. The previous value is best-effort (the
/// Control Manager reads it just ahead of the write and passes `None` if
/// that read failed), never itself a reason to fail the write.
pub struct AuditLogger {
    log_file: Option<PathBuf>,
    emit_to_stdout: bool,
    file_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(log_file: Option<PathBuf>, emit_to_stdout: bool) -> Self {
        Self {
            log_file,
            emit_to_stdout,
            file_lock: Mutex::new(()),
        }
    }

    pub async fn log_write(
        &self,
        node_id: &str,
        user_id: Option<&str>,
        previous_value: Option<&AasValue>,
        new_value: &AasValue,
        correlation_id: Option<&str>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            event_type: "WRITE",
            node_id: node_id.to_string(),
            user_id: user_id.unwrap_or("system").to_string(),
            previous_value: serialize_value(previous_value),
            new_value: serialize_value(Some(new_value)),
            correlation_id: correlation_id.map(str::to_string),
        };

        if self.emit_to_stdout {
            info!(
                timestamp = %entry.timestamp,
                node_id = %entry.node_id,
                user_id = %entry.user_id,
                previous_value = %entry.previous_value,
                new_value = %entry.new_value,
                correlation_id = ?entry.correlation_id,
                "audit_entry"
            );
        }

        let Some(path) = &self.log_file else {
            return;
        };

        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };

        let _guard = self.file_lock.lock().await;
        match OpenOptions::new().create(true).append(true).open(path).await {
            Ok(mut file) => {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "audit_log_write_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_value_renders_bytes_as_length_marker() {
        assert_eq!(
            serialize_value(Some(&AasValue::Bytes(vec![1, 2, 3]))),
            Value::String("<bytes:3>".to_string())
        );
    }

    #[test]
    fn serialize_value_none_is_null() {
        assert_eq!(serialize_value(None), Value::Null);
    }

    #[tokio::test]
    async fn log_write_without_a_file_path_does_not_panic() {
        let logger = AuditLogger::new(None, true);
        logger
            .log_write("ns=2;s=Temperature", Some("operator"), None, &AasValue::Float(21.5), None)
            .await;
    }
}
