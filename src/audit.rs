/// Audit logging for kernel-affecting operations
///
/// Every lifecycle transition, group toggle, preset change, flush and
/// verification is appended to `<state_dir>/audit.log` as one JSON object
/// per line. Failing to write the audit trail never fails the operation.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Stop,
    Recover,
    EnableGroup,
    DisableGroup,
    DeleteGroup,
    ApplyPreset,
    RemovePreset,
    VerifyRules,
    FlushTable,
    FlushRouteCache,
    IpForward,
    LegacyApply,
    LegacyRemove,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut json = serde_json::to_string(event)?;
        json.push('\n');

        if let Some(dir) = self.log_path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.log_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Records an event, downgrading write failures to a warning
    pub fn record(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let event = AuditEvent::new(event_type, success, details, error);
        if let Err(e) = self.log(&event) {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent `count` events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(&self.log_path)?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::VerifyRules,
            false,
            serde_json::json!({"missing": 2}),
            Some("drift detected".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("verify_rules"));
        assert!(json.contains("drift detected"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"enable_group","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::EnableGroup);
    }

    #[test]
    fn test_record_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("state").join("audit.log"));
        audit.record(
            EventType::Start,
            true,
            serde_json::json!({"groups": 1}),
            None,
        );
        audit.record(
            EventType::Stop,
            false,
            serde_json::json!({}),
            Some("nft failed".into()),
        );

        let recent = audit.read_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, EventType::Stop);
        assert_eq!(recent[1].details["groups"], 1);
    }

    #[test]
    fn test_record_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the open fail
        let audit = AuditLog::at(dir.path());
        audit.record(EventType::FlushTable, true, serde_json::json!({}), None);
        assert!(audit.read_recent(1).is_err());
    }
}
