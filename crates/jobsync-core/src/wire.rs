use crate::{
    deserialize_lenient_bool, deserialize_lenient_string, deserialize_lenient_vec,
    deserialize_optional_id, deserialize_optional_phase, deserialize_optional_timestamp,
    ActivityEntry, ActivityKind, JobEvent, JobInfo, JobPhase, JobStatus, Source,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

const INBOUND_TYPES: [&str; 4] = ["active_jobs", "job_update", "job_state", "job_event"];

/// Frames pushed by the job source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    ActiveJobs {
        #[serde(default)]
        jobs: Vec<JobInfo>,
    },
    JobUpdate {
        job: JobInfo,
    },
    JobState {
        #[serde(default)]
        project_id: Option<String>,
        #[serde(default)]
        thread_id: Option<String>,
        /// `null` when the thread has no current job.
        #[serde(default)]
        state: Option<JobStateFrame>,
    },
    JobEvent {
        event: JobEvent,
    },
}

/// Control frames sent to the job source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Subscribe {
        project_id: String,
        thread_id: String,
    },
    Unsubscribe,
}

/// Server-side job snapshot as it appears on the wire. Everything but the
/// identity is optional; see [`crate::JobState::from_frame`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStateFrame {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub thread_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default, deserialize_with = "deserialize_optional_phase")]
    pub current_phase: Option<JobPhase>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub current_action: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub acknowledgment: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub sources: Vec<Source>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub thinking: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub activity: Vec<ActivityFrame>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
}

/// One activity record as the server reports it. Kinds this client does not
/// know, and entries with no kind at all, are dropped on adoption.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivityFrame {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<ActivityKind>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub tool: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_bool")]
    pub found: Option<bool>,
}

impl ActivityFrame {
    /// `seq` is the entry's position in the adopted trail and `received_at`
    /// stands in for a missing timestamp.
    pub fn into_entry(self, seq: usize, received_at: DateTime<Utc>) -> Option<ActivityEntry> {
        let kind = match self.kind {
            Some(ActivityKind::Unknown) | None => return None,
            Some(kind) => kind,
        };
        let timestamp = self.timestamp.unwrap_or(received_at);
        let id = self.id.unwrap_or_else(|| {
            format!("{}-{}-{}", kind.as_str(), timestamp.timestamp_millis(), seq)
        });
        Some(ActivityEntry {
            id,
            kind,
            timestamp,
            tool: self.tool,
            query: self.query,
            found: self.found,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame is not json: {0}")]
    NotJson(String),
    #[error("frame has no string type field")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {message}")]
    Payload { kind: String, message: String },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Decodes one inbound text frame. The `type` tag is validated before the
/// body so that unknown frame kinds and broken payloads log distinctly.
pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameError::NotJson(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    if !INBOUND_TYPES.contains(&kind.as_str()) {
        return Err(FrameError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|err| FrameError::Payload {
        kind,
        message: err.to_string(),
    })
}

pub fn encode_control(frame: &OutboundFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))
}
