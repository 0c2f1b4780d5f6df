//! Build step model.
//!
//! A step stores the data for one command of a build. The slave executes
//! the command; the master only ingests its progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::models::RepositoryId;
use crate::timefmt;

/// Status of a build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Fail,
    Success,
    Exception,
    Warning,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Fail => "fail",
            StepStatus::Success => "success",
            StepStatus::Exception => "exception",
            StepStatus::Warning => "warning",
            StepStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(StepStatus::Running),
            "fail" => Ok(StepStatus::Fail),
            "success" => Ok(StepStatus::Success),
            "exception" => Ok(StepStatus::Exception),
            "warning" => Ok(StepStatus::Warning),
            "cancelled" => Ok(StepStatus::Cancelled),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// One command inside a build, with its own output and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub uuid: Uuid,
    pub repository_id: RepositoryId,
    pub name: String,
    pub command: String,
    pub status: StepStatus,
    /// Step output. Append-only: it grows through output frames and is
    /// only replaced wholesale by a full step frame.
    pub output: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Position of the step within its build.
    pub index: i64,
    /// Total time spent in the step, in seconds.
    pub total_time: Option<i64>,
}

impl BuildStep {
    pub fn new(repository_id: RepositoryId, name: &str, command: &str, index: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            repository_id,
            name: name.to_string(),
            command: command.to_string(),
            status: StepStatus::Running,
            output: String::new(),
            started: None,
            finished: None,
            index,
            total_time: None,
        }
    }

    /// Builds a step from a `step_info` wire frame.
    pub fn from_wire(repository_id: RepositoryId, info: &Value) -> Result<Self> {
        let uuid: Uuid = info
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()?;
        let status: StepStatus = info
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("running")
            .parse()
            .unwrap_or(StepStatus::Running);

        Ok(Self {
            uuid,
            repository_id,
            name: str_field(info, "name"),
            command: str_field(info, "cmd"),
            status,
            output: str_field(info, "output"),
            started: wire_dt(info, "started")?,
            finished: wire_dt(info, "finished")?,
            index: info.get("index").and_then(Value::as_i64).unwrap_or(0),
            total_time: info.get("total_time").and_then(Value::as_i64),
        })
    }

    /// Message payload published for step lifecycle events.
    pub fn to_message(&self, repository_id: &RepositoryId, event_type: &str) -> Value {
        json!({
            "uuid": self.uuid.to_string(),
            "name": self.name,
            "command": self.command,
            "status": self.status.as_str(),
            "output": self.output,
            "index": self.index,
            "started": self.started.map(|dt| dt.to_rfc3339()),
            "finished": self.finished.map(|dt| dt.to_rfc3339()),
            "total_time": self.total_time,
            "repository_id": repository_id.to_string(),
            "event_type": event_type,
        })
    }
}

fn str_field(info: &Value, key: &str) -> String {
    info.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn wire_dt(info: &Value, key: &'static str) -> Result<Option<DateTime<Utc>>> {
    match info.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(Some(timefmt::parse_wire(key, s)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_is_terminal() {
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Fail.is_terminal());
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Exception.is_terminal());
        assert!(StepStatus::Warning.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_from_wire() {
        let uuid = Uuid::new_v4();
        let info = json!({
            "uuid": uuid.to_string(),
            "cmd": "ls",
            "name": "run ls",
            "status": "running",
            "output": "",
            "started": "3 10 23 22:53:11 2024 -0300",
            "finished": null,
            "index": 0,
        });

        let step = BuildStep::from_wire(RepositoryId::new(), &info).unwrap();
        assert_eq!(step.uuid, uuid);
        assert_eq!(step.command, "ls");
        assert_eq!(step.name, "run ls");
        assert_eq!(step.status, StepStatus::Running);
        assert!(step.started.is_some());
        assert!(step.finished.is_none());
        assert_eq!(step.index, 0);
    }

    #[test]
    fn test_from_wire_bad_uuid() {
        let info = json!({"uuid": "nope", "cmd": "ls", "name": "ls"});
        assert!(BuildStep::from_wire(RepositoryId::new(), &info).is_err());
    }

    #[test]
    fn test_to_message_carries_event_type() {
        let step = BuildStep::new(RepositoryId::new(), "ls", "ls -la", 0);
        let msg = step.to_message(&step.repository_id.clone(), "step-started");
        assert_eq!(msg["event_type"], "step-started");
        assert_eq!(msg["command"], "ls -la");
    }
}
