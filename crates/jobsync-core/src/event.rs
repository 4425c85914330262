use crate::{
    deserialize_lenient_bool, deserialize_lenient_string, deserialize_lenient_vec,
    deserialize_optional_id, deserialize_text, JobStatus, Source,
};
use serde::{Deserialize, Serialize};

/// One incremental step of job progress.
///
/// Identity fields are optional on the wire; the body is keyed by `type`.
/// Unrecognised types decode as [`JobEventBody::Unknown`] instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub job_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub thread_id: Option<String>,
    #[serde(flatten)]
    pub body: JobEventBody,
}

/// Fields are read leniently: a null or oddly typed value degrades to empty
/// rather than failing the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventBody {
    Status {
        #[serde(default, deserialize_with = "deserialize_text")]
        status: String,
    },
    Plan {
        #[serde(default, deserialize_with = "deserialize_lenient_string")]
        acknowledgment: Option<String>,
    },
    ToolCall {
        #[serde(default, deserialize_with = "deserialize_lenient_string")]
        tool: Option<String>,
        #[serde(default, deserialize_with = "deserialize_lenient_string")]
        query: Option<String>,
    },
    ToolResult {
        #[serde(default, deserialize_with = "deserialize_lenient_string")]
        tool: Option<String>,
        #[serde(default, deserialize_with = "deserialize_lenient_string")]
        query: Option<String>,
        #[serde(default, deserialize_with = "deserialize_lenient_bool")]
        found: Option<bool>,
    },
    Chunk {
        #[serde(default, deserialize_with = "deserialize_text")]
        content: String,
    },
    Thinking {
        #[serde(default, deserialize_with = "deserialize_text")]
        content: String,
    },
    Sources {
        #[serde(default, deserialize_with = "deserialize_lenient_vec")]
        sources: Vec<Source>,
    },
    Error {
        #[serde(default, deserialize_with = "deserialize_lenient_string")]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl JobEvent {
    pub fn new(job_id: Option<&str>, thread_id: Option<&str>, body: JobEventBody) -> Self {
        Self {
            job_id: job_id.map(str::to_string),
            thread_id: thread_id.map(str::to_string),
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.body {
            JobEventBody::Status { .. } => "status",
            JobEventBody::Plan { .. } => "plan",
            JobEventBody::ToolCall { .. } => "tool_call",
            JobEventBody::ToolResult { .. } => "tool_result",
            JobEventBody::Chunk { .. } => "chunk",
            JobEventBody::Thinking { .. } => "thinking",
            JobEventBody::Sources { .. } => "sources",
            JobEventBody::Error { .. } => "error",
            JobEventBody::Unknown => "unknown",
        }
    }

    /// Parsed status for `status` events; `None` for other kinds or for a
    /// status string this client does not know.
    pub fn status(&self) -> Option<JobStatus> {
        match &self.body {
            JobEventBody::Status { status } => status.parse().ok(),
            _ => None,
        }
    }
}
