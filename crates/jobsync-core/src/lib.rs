use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod active_jobs;
pub mod event;
pub mod reducer;
pub mod wire;

pub use active_jobs::ActiveJobIndex;
pub use event::{JobEvent, JobEventBody};
pub use reducer::{accumulate, reduce};
pub use wire::{InboundFrame, JobStateFrame, OutboundFrame};

/// A (project, thread) pair. A thread has at most one current job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ThreadRef {
    pub project_id: String,
    pub thread_id: String,
}

impl ThreadRef {
    pub fn new(project_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.thread_id)
    }
}

/// Wire statuses decode through [`FromStr`], so aliases and letter case are
/// accepted the same way everywhere; anything else becomes `Unknown`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Unknown => "unknown",
        }
    }

    /// Pending and running jobs count towards the active-job badges.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val: Value = Value::deserialize(deserializer)?;
        Ok(val
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(JobStatus::Unknown))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" | "queued" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" | "complete" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

/// UI-facing progress label. Derived locally from event history, never
/// taken as authoritative from the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Initializing,
    Planning,
    Searching,
    Responding,
    Done,
    Error,
}

impl Default for JobPhase {
    fn default() -> Self {
        Self::Initializing
    }
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Initializing => "initializing",
            JobPhase::Planning => "planning",
            JobPhase::Searching => "searching",
            JobPhase::Responding => "responding",
            JobPhase::Done => "done",
            JobPhase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Error)
    }

    /// Planning and searching may alternate; once the answer streams or the
    /// job ends the phase only moves to a terminal value.
    pub fn accepts_pre_response(&self) -> bool {
        !matches!(
            self,
            JobPhase::Responding | JobPhase::Done | JobPhase::Error
        )
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPhase {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "initializing" => Ok(JobPhase::Initializing),
            "planning" => Ok(JobPhase::Planning),
            "searching" => Ok(JobPhase::Searching),
            "responding" => Ok(JobPhase::Responding),
            "done" => Ok(JobPhase::Done),
            "error" => Ok(JobPhase::Error),
            other => Err(format!("Unknown job phase: {other}")),
        }
    }
}

/// Summary of one job as carried by `active_jobs` and `job_update` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobInfo {
    pub project_id: String,
    pub thread_id: String,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub job_id: Option<String>,
}

impl JobInfo {
    pub fn thread(&self) -> ThreadRef {
        ThreadRef::new(self.project_id.clone(), self.thread_id.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ToolCall,
    ToolResult,
    #[serde(other)]
    Unknown,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ToolCall => "tool_call",
            ActivityKind::ToolResult => "tool_result",
            ActivityKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub found: Option<bool>,
}

/// A citation. Only the common fields are typed; the rest rides along.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Full mirror of the subscribed thread's current job.
///
/// Instances are shared behind `Arc` and never mutated in place: the reducer
/// returns a new value for every change so callers can detect updates with
/// `Arc::ptr_eq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub project_id: String,
    pub thread_id: String,
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub current_phase: JobPhase,
    pub current_action: Option<String>,
    pub acknowledgment: Option<String>,
    pub content: String,
    pub sources: Vec<Source>,
    pub thinking: Option<String>,
    pub activity: Vec<ActivityEntry>,
    pub started_at: DateTime<Utc>,
}

impl JobState {
    /// Fresh state for a job whose snapshot has not arrived yet.
    pub fn synthesized(thread: ThreadRef, job_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            project_id: thread.project_id,
            thread_id: thread.thread_id,
            job_id,
            status: JobStatus::Running,
            current_phase: JobPhase::Initializing,
            current_action: None,
            acknowledgment: None,
            content: String::new(),
            sources: Vec::new(),
            thinking: None,
            activity: Vec::new(),
            started_at: now,
        }
    }

    /// Adopts a server snapshot. `fallback` supplies the identity when the
    /// snapshot omits it; a missing phase is derived from the snapshot body.
    pub fn from_frame(frame: JobStateFrame, fallback: &ThreadRef, now: DateTime<Utc>) -> Self {
        let status = frame.status.unwrap_or_default();
        let content = frame.content.unwrap_or_default();
        let mut activity = Vec::with_capacity(frame.activity.len());
        for entry in frame.activity {
            if let Some(entry) = entry.into_entry(activity.len(), now) {
                activity.push(entry);
            }
        }
        let current_phase = frame
            .current_phase
            .unwrap_or_else(|| derive_phase(status, &content, activity.is_empty()));
        Self {
            project_id: non_empty(frame.project_id).unwrap_or_else(|| fallback.project_id.clone()),
            thread_id: non_empty(frame.thread_id).unwrap_or_else(|| fallback.thread_id.clone()),
            job_id: non_empty(frame.job_id),
            status,
            current_phase,
            current_action: frame.current_action,
            acknowledgment: frame.acknowledgment,
            content,
            sources: frame.sources,
            thinking: frame.thinking,
            activity,
            started_at: frame.started_at.unwrap_or(now),
        }
    }

    pub fn thread(&self) -> ThreadRef {
        ThreadRef::new(self.project_id.clone(), self.thread_id.clone())
    }
}

fn derive_phase(status: JobStatus, content: &str, no_activity: bool) -> JobPhase {
    match status {
        JobStatus::Completed | JobStatus::Cancelled => JobPhase::Done,
        JobStatus::Failed => JobPhase::Error,
        _ if !content.is_empty() => JobPhase::Responding,
        _ if !no_activity => JobPhase::Searching,
        _ => JobPhase::Initializing,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Like [`deserialize_id`], but absent, null or odd values become `None`.
pub(crate) fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match val {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Optional text that must never fail a frame: non-strings become `None`.
pub(crate) fn deserialize_lenient_string<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match val {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

/// Streamed text: null or non-string deltas count as empty.
pub(crate) fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_lenient_string(deserializer)?.unwrap_or_default())
}

pub(crate) fn deserialize_lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(val.as_ref().and_then(Value::as_bool))
}

/// A list where entries this client cannot read are skipped rather than
/// failing the whole frame. Null or non-array values decode as empty.
pub(crate) fn deserialize_lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match val {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// Timestamps arrive either as RFC 3339 strings or as epoch milliseconds.
pub(crate) fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    timestamp_from_value(&val)
        .ok_or_else(|| serde::de::Error::custom("expected rfc3339 string or epoch millis"))
}

pub(crate) fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(val.as_ref().and_then(timestamp_from_value))
}

/// Unknown phase labels are dropped so the local derivation takes over.
pub(crate) fn deserialize_optional_phase<'de, D>(
    deserializer: D,
) -> Result<Option<JobPhase>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(val
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<JobPhase>().ok()))
}
