//! Job and execution record types.
//!
//! Field names serialize in camelCase and timestamps as RFC 3339, which is
//! the on-disk shape of `jobs.json` and `executions.json`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SchedulerError;

/// A recurring job definition, owned by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque unique identifier (UUID v4), never reused.
    pub id: String,
    /// Display name; copied into every execution record.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Which fields of `schedule_config` are meaningful.
    pub schedule_type: ScheduleType,
    /// Schedule parameters for `schedule_type`.
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
    /// Whether the engine should arm a timer for this job.
    #[serde(default)]
    pub status: JobStatus,
    /// When the job last executed.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Advisory next fire time, written after each arm.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    /// Number of logged executions.
    #[serde(default)]
    pub execution_count: u64,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new active job with a fresh id.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schedule_type: ScheduleType,
        schedule_config: ScheduleConfig,
    ) -> Result<Self, SchedulerError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("job name is required".into()));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description: description.into(),
            schedule_type,
            schedule_config,
            status: JobStatus::Active,
            last_run: None,
            next_run: None,
            execution_count: 0,
            created_at: Utc::now(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some((schedule_type, schedule_config)) = update.schedule {
            self.schedule_type = schedule_type;
            self.schedule_config = schedule_config;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(last_run) = update.last_run {
            self.last_run = Some(last_run);
        }
        if let Some(next_run) = update.next_run {
            self.next_run = Some(next_run);
        }
    }
}

/// Schedule type tag.
///
/// Unrecognized tags are kept verbatim so that a record written by a newer
/// host survives a load/save cycle; such jobs are never scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScheduleType {
    Hourly,
    Daily,
    Weekly,
    Other(String),
}

impl From<String> for ScheduleType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "hourly" => ScheduleType::Hourly,
            "daily" => ScheduleType::Daily,
            "weekly" => ScheduleType::Weekly,
            _ => ScheduleType::Other(s),
        }
    }
}

impl From<ScheduleType> for String {
    fn from(t: ScheduleType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleType::Hourly => f.write_str("hourly"),
            ScheduleType::Daily => f.write_str("daily"),
            ScheduleType::Weekly => f.write_str("weekly"),
            ScheduleType::Other(s) => f.write_str(s),
        }
    }
}

/// Schedule parameters. Which fields apply depends on the [`ScheduleType`].
///
/// A stored config that does not have this shape (a string minute, a
/// negative day, `null`) is kept verbatim in `malformed` and written back
/// unchanged; such a job is never scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub struct ScheduleConfig {
    /// Minute of the hour (hourly).
    pub minute: Option<u32>,
    /// Legacy hour field. Accepted on load, never read.
    pub hour: Option<u32>,
    /// Day of week, 0 = Sunday (weekly).
    pub day_of_week: Option<u32>,
    /// "HH:MM" (daily and weekly).
    pub time: Option<String>,
    /// Raw stored value that could not be read as a config.
    pub malformed: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    day_of_week: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
}

impl From<serde_json::Value> for ScheduleConfig {
    fn from(value: serde_json::Value) -> Self {
        match ConfigFields::deserialize(&value) {
            Ok(fields) => Self {
                minute: fields.minute,
                hour: fields.hour,
                day_of_week: fields.day_of_week,
                time: fields.time,
                malformed: None,
            },
            Err(_) => Self {
                malformed: Some(value),
                ..Self::default()
            },
        }
    }
}

impl From<ScheduleConfig> for serde_json::Value {
    fn from(config: ScheduleConfig) -> Self {
        if let Some(raw) = config.malformed {
            return raw;
        }
        let fields = ConfigFields {
            minute: config.minute,
            hour: config.hour,
            day_of_week: config.day_of_week,
            time: config.time,
        };
        serde_json::to_value(fields).unwrap_or_default()
    }
}

impl ScheduleConfig {
    pub fn hourly(minute: u32) -> Self {
        Self {
            minute: Some(minute),
            ..Self::default()
        }
    }

    pub fn daily(time: impl Into<String>) -> Self {
        Self {
            time: Some(time.into()),
            ..Self::default()
        }
    }

    pub fn weekly(day_of_week: u32, time: impl Into<String>) -> Self {
        Self {
            day_of_week: Some(day_of_week),
            time: Some(time.into()),
            ..Self::default()
        }
    }
}

/// Job status as seen by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Armed by the engine.
    #[default]
    Active,
    /// Never armed.
    Paused,
    /// Just executed; the host reverts this to `Active` after a short window.
    Completed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
        };
        f.pad(s)
    }
}

/// Partial update of a [`Job`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<(ScheduleType, ScheduleConfig)>,
    pub status: Option<JobStatus>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn next_run(next_run: DateTime<Utc>) -> Self {
        Self {
            next_run: Some(next_run),
            ..Self::default()
        }
    }
}

/// Outcome of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    /// Reserved; the engine does not currently produce failures.
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        })
    }
}

/// One logged firing of a job.
///
/// `job_name` is a snapshot taken at execution time, so renaming a job does
/// not rewrite its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub output: String,
    /// Simulated execution time in milliseconds.
    #[serde(deserialize_with = "whole_millis")]
    pub duration: u64,
}

/// Older logs store fractional milliseconds; round them on load.
fn whole_millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = f64::deserialize(deserializer)?;
    if !ms.is_finite() || ms < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "invalid duration: {ms}"
        )));
    }
    Ok(ms.round() as u64)
}

impl JobExecution {
    /// The fixed side effect every job produces.
    pub fn hello(
        job_id: &str,
        job_name: &str,
        executed_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            executed_at,
            status: ExecutionStatus::Success,
            output: format!("Hello World from {job_name}!"),
            duration: duration_ms,
        }
    }
}

/// Per-job aggregation over the execution log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub average_duration_ms: f64,
}

/// Aggregation over the whole execution log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    pub total_executions: usize,
    pub unique_jobs: usize,
    pub average_duration_ms: f64,
}
