//! Pure merge of job events into the subscribed thread's [`JobState`].
//!
//! Both entry points take the current snapshot and return the next one. An
//! event that changes nothing hands back the same `Arc`, so callers detect
//! changes with `Arc::ptr_eq`. Neither function performs I/O or reads the
//! clock; `now` is supplied by the caller.
//!
//! [`reduce`] tracks phase, status and the activity trail. [`accumulate`]
//! appends streamed text and replaces sources. They are kept apart so that a
//! problem assembling content can never disturb phase tracking.

use crate::{
    ActivityEntry, ActivityKind, JobEvent, JobEventBody, JobPhase, JobState, JobStatus, ThreadRef,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// True when `event` names a job other than the one `state` mirrors. Events
/// without a job id, or a state whose job id is still unknown, never count as
/// foreign.
pub fn is_foreign(state: &JobState, event: &JobEvent) -> bool {
    matches!(
        (state.job_id.as_deref(), event.job_id.as_deref()),
        (Some(current), Some(incoming)) if current != incoming
    )
}

/// True when `event` is a `running` status for a job other than the
/// finished one `state` mirrors. That is the start of a follow-up job on the
/// same thread, and it replaces the state instead of being discarded.
pub fn starts_new_job(state: &JobState, event: &JobEvent) -> bool {
    state.status.is_terminal()
        && event.status() == Some(JobStatus::Running)
        && matches!(
            event.job_id.as_deref(),
            Some(incoming) if state.job_id.as_deref() != Some(incoming)
        )
}

/// Events that must leave `state` untouched: they name another job and do
/// not start a new one.
pub fn is_stale(state: &JobState, event: &JobEvent) -> bool {
    is_foreign(state, event) && !starts_new_job(state, event)
}

/// Applies the phase/status/activity part of `event`.
///
/// `thread` is the watched thread, used as the identity of a state
/// synthesized from a bare `running` status.
pub fn reduce(
    current: Option<&Arc<JobState>>,
    event: &JobEvent,
    thread: &ThreadRef,
    now: DateTime<Utc>,
) -> Option<Arc<JobState>> {
    if let Some(state) = current {
        if is_stale(state, event) {
            return Some(state.clone());
        }
    }

    match &event.body {
        JobEventBody::ToolCall { tool, query } => current.map(|state| {
            append_activity(state, ActivityKind::ToolCall, tool, query, None, now)
        }),
        JobEventBody::ToolResult { tool, query, found } => current.map(|state| {
            append_activity(state, ActivityKind::ToolResult, tool, query, *found, now)
        }),
        JobEventBody::Plan { acknowledgment } => {
            let ack = acknowledgment
                .as_deref()
                .map(str::trim)
                .filter(|ack| !ack.is_empty());
            match (current, ack) {
                (Some(state), Some(ack)) => Some(apply_plan(state, ack)),
                _ => current.cloned(),
            }
        }
        JobEventBody::Chunk { .. } => current.map(begin_responding),
        JobEventBody::Status { .. } => apply_status(current, event, thread, now),
        JobEventBody::Error { message } => current.map(|state| apply_error(state, message)),
        JobEventBody::Thinking { .. } | JobEventBody::Sources { .. } | JobEventBody::Unknown => {
            current.cloned()
        }
    }
}

/// Folds streamed text and sources into the state. Phase is left alone.
pub fn accumulate(current: Option<&Arc<JobState>>, event: &JobEvent) -> Option<Arc<JobState>> {
    let state = current?;
    if is_stale(state, event) {
        return Some(state.clone());
    }

    match &event.body {
        JobEventBody::Chunk { content } if !content.is_empty() => {
            let mut next = JobState::clone(state);
            next.content.push_str(content);
            Some(Arc::new(next))
        }
        JobEventBody::Thinking { content } if !content.is_empty() => {
            let mut next = JobState::clone(state);
            next.thinking.get_or_insert_with(String::new).push_str(content);
            Some(Arc::new(next))
        }
        JobEventBody::Sources { sources } if *sources != state.sources => {
            let mut next = JobState::clone(state);
            next.sources = sources.clone();
            Some(Arc::new(next))
        }
        _ => Some(state.clone()),
    }
}

fn append_activity(
    state: &Arc<JobState>,
    kind: ActivityKind,
    tool: &Option<String>,
    query: &Option<String>,
    found: Option<bool>,
    now: DateTime<Utc>,
) -> Arc<JobState> {
    let mut next = JobState::clone(state);
    // Every receipt is its own history entry, duplicates included.
    next.activity.push(ActivityEntry {
        id: format!(
            "{}-{}-{}",
            kind.as_str(),
            now.timestamp_millis(),
            state.activity.len()
        ),
        kind,
        timestamp: now,
        tool: tool.clone(),
        query: query.clone(),
        found,
    });
    if kind == ActivityKind::ToolCall && next.current_phase.accepts_pre_response() {
        next.current_phase = JobPhase::Searching;
    }
    Arc::new(next)
}

fn apply_plan(state: &Arc<JobState>, ack: &str) -> Arc<JobState> {
    let moves_phase = state.current_phase.accepts_pre_response();
    let unchanged = state.acknowledgment.as_deref() == Some(ack)
        && (!moves_phase
            || (state.current_phase == JobPhase::Planning
                && state.current_action.as_deref() == Some(ack)));
    if unchanged {
        return state.clone();
    }

    let mut next = JobState::clone(state);
    next.acknowledgment = Some(ack.to_string());
    if moves_phase {
        next.current_phase = JobPhase::Planning;
        next.current_action = Some(ack.to_string());
    }
    Arc::new(next)
}

fn begin_responding(state: &Arc<JobState>) -> Arc<JobState> {
    if state.current_phase == JobPhase::Responding || state.current_phase.is_terminal() {
        return state.clone();
    }
    let mut next = JobState::clone(state);
    next.current_phase = JobPhase::Responding;
    next.current_action = None;
    Arc::new(next)
}

fn apply_status(
    current: Option<&Arc<JobState>>,
    event: &JobEvent,
    thread: &ThreadRef,
    now: DateTime<Utc>,
) -> Option<Arc<JobState>> {
    let Some(status) = event.status() else {
        return current.cloned();
    };

    match (current, status) {
        // Race tolerance: the job started before its snapshot reached us.
        // Precondition: no state, or a finished state for an earlier job.
        (None, JobStatus::Running) => Some(Arc::new(synthesize(event, thread, now))),
        (Some(state), JobStatus::Running) if starts_new_job(state, event) => {
            Some(Arc::new(synthesize(event, thread, now)))
        }
        (Some(state), JobStatus::Running) => {
            if state.status == JobStatus::Running || state.status.is_terminal() {
                return Some(state.clone());
            }
            let mut next = JobState::clone(state);
            next.status = JobStatus::Running;
            Some(Arc::new(next))
        }
        (Some(state), terminal) if terminal.is_terminal() => {
            let phase = if terminal == JobStatus::Failed {
                JobPhase::Error
            } else {
                JobPhase::Done
            };
            if state.status == terminal && state.current_phase == phase {
                return Some(state.clone());
            }
            let mut next = JobState::clone(state);
            next.status = terminal;
            next.current_phase = phase;
            next.current_action = None;
            Some(Arc::new(next))
        }
        _ => current.cloned(),
    }
}

fn synthesize(event: &JobEvent, thread: &ThreadRef, now: DateTime<Utc>) -> JobState {
    JobState::synthesized(thread.clone(), event.job_id.clone(), now)
}

fn apply_error(state: &Arc<JobState>, message: &Option<String>) -> Arc<JobState> {
    if state.current_phase == JobPhase::Error && state.current_action == *message {
        return state.clone();
    }
    let mut next = JobState::clone(state);
    next.current_phase = JobPhase::Error;
    next.current_action = message.clone();
    Arc::new(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn thread() -> ThreadRef {
        ThreadRef::new("P1", "T1")
    }

    fn at(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000)
            .single()
            .expect("valid timestamp")
            + Duration::milliseconds(offset_ms)
    }

    fn event(job_id: Option<&str>, body: JobEventBody) -> JobEvent {
        JobEvent::new(job_id, Some("T1"), body)
    }

    fn status(job_id: Option<&str>, value: &str) -> JobEvent {
        event(
            job_id,
            JobEventBody::Status {
                status: value.to_string(),
            },
        )
    }

    fn tool_call(job_id: Option<&str>, query: &str) -> JobEvent {
        event(
            job_id,
            JobEventBody::ToolCall {
                tool: Some("web_search".to_string()),
                query: Some(query.to_string()),
            },
        )
    }

    fn tool_result(job_id: Option<&str>, found: bool) -> JobEvent {
        event(
            job_id,
            JobEventBody::ToolResult {
                tool: Some("web_search".to_string()),
                query: None,
                found: Some(found),
            },
        )
    }

    fn plan(ack: &str) -> JobEvent {
        event(
            Some("job-1"),
            JobEventBody::Plan {
                acknowledgment: Some(ack.to_string()),
            },
        )
    }

    fn chunk(text: &str) -> JobEvent {
        event(
            Some("job-1"),
            JobEventBody::Chunk {
                content: text.to_string(),
            },
        )
    }

    fn running_state(job_id: Option<&str>) -> Arc<JobState> {
        Arc::new(JobState::synthesized(
            thread(),
            job_id.map(str::to_string),
            at(0),
        ))
    }

    #[test]
    fn running_status_synthesizes_state_when_none_exists() {
        let next = reduce(None, &status(Some("job-1"), "running"), &thread(), at(5))
            .expect("synthesized state");
        assert_eq!(next.current_phase, JobPhase::Initializing);
        assert_eq!(next.status, JobStatus::Running);
        assert_eq!(next.job_id.as_deref(), Some("job-1"));
        assert_eq!(next.project_id, "P1");
        assert_eq!(next.started_at, at(5));
        assert!(next.activity.is_empty());
        assert!(next.content.is_empty());
    }

    #[test]
    fn non_running_status_without_state_is_ignored() {
        assert!(reduce(None, &status(Some("job-1"), "pending"), &thread(), at(0)).is_none());
        assert!(reduce(None, &status(Some("job-1"), "completed"), &thread(), at(0)).is_none());
    }

    #[test]
    fn duplicate_running_status_is_reference_stable() {
        let state = running_state(Some("job-1"));
        let once = reduce(Some(&state), &status(Some("job-1"), "running"), &thread(), at(1))
            .expect("state");
        let twice = reduce(Some(&once), &status(Some("job-1"), "running"), &thread(), at(2))
            .expect("state");
        assert!(Arc::ptr_eq(&state, &once));
        assert!(Arc::ptr_eq(&once, &twice));
    }

    #[test]
    fn running_status_keeps_snapshot_with_unknown_job_id() {
        // subscribe -> job_state{job_id: null} -> status running
        let snapshot = Arc::new(JobState {
            status: JobStatus::Pending,
            ..JobState::synthesized(thread(), None, at(0))
        });
        let next = reduce(Some(&snapshot), &status(Some("job-1"), "running"), &thread(), at(3))
            .expect("state");
        assert_eq!(next.current_phase, JobPhase::Initializing);
        assert_eq!(next.status, JobStatus::Running);
        assert_eq!(next.job_id, None);
    }

    #[test]
    fn foreign_job_events_never_mutate_state() {
        let state = running_state(Some("job-1"));
        let events = [
            tool_call(Some("job-2"), "stale"),
            status(Some("job-2"), "running"),
            status(Some("job-2"), "failed"),
            event(
                Some("job-2"),
                JobEventBody::Plan {
                    acknowledgment: Some("old plan".to_string()),
                },
            ),
            event(
                Some("job-2"),
                JobEventBody::Chunk {
                    content: "old".to_string(),
                },
            ),
        ];
        for stale in &events {
            let next = reduce(Some(&state), stale, &thread(), at(9)).expect("state");
            assert!(Arc::ptr_eq(&state, &next), "{}", stale.kind());
            let next = accumulate(Some(&state), stale).expect("state");
            assert!(Arc::ptr_eq(&state, &next), "{}", stale.kind());
        }
    }

    #[test]
    fn follow_up_job_replaces_finished_state() {
        let finished = Arc::new(JobState {
            status: JobStatus::Completed,
            current_phase: JobPhase::Done,
            content: "first answer".to_string(),
            ..JobState::synthesized(thread(), Some("job-1".to_string()), at(0))
        });

        let started = reduce(Some(&finished), &status(Some("job-2"), "running"), &thread(), at(10))
            .expect("state");
        assert_eq!(started.job_id.as_deref(), Some("job-2"));
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.current_phase, JobPhase::Initializing);
        assert_eq!(started.started_at, at(10));
        assert!(started.content.is_empty());

        let planned = reduce(
            Some(&started),
            &event(
                Some("job-2"),
                JobEventBody::Plan {
                    acknowledgment: Some("Looking again".to_string()),
                },
            ),
            &thread(),
            at(11),
        )
        .expect("state");
        assert_eq!(planned.current_phase, JobPhase::Planning);

        let answer = event(
            Some("job-2"),
            JobEventBody::Chunk {
                content: "new answer".to_string(),
            },
        );
        let reduced = reduce(Some(&planned), &answer, &thread(), at(12));
        let streamed = accumulate(reduced.as_ref(), &answer).expect("state");
        assert_eq!(streamed.current_phase, JobPhase::Responding);
        assert_eq!(streamed.content, "new answer");

        // The old job's trailing events are now the stale ones.
        let late = reduce(Some(&streamed), &tool_call(Some("job-1"), "old"), &thread(), at(13))
            .expect("state");
        assert!(Arc::ptr_eq(&streamed, &late));
    }

    #[test]
    fn running_status_for_another_job_does_not_replace_live_state() {
        let state = running_state(Some("job-1"));
        assert!(!starts_new_job(&state, &status(Some("job-2"), "running")));
        assert!(is_stale(&state, &status(Some("job-2"), "running")));

        let finished = Arc::new(JobState {
            status: JobStatus::Failed,
            ..JobState::synthesized(thread(), Some("job-1".to_string()), at(0))
        });
        assert!(!starts_new_job(&finished, &status(Some("job-1"), "running")));
        assert!(!starts_new_job(&finished, &status(None, "running")));
        assert!(!starts_new_job(&finished, &status(Some("job-2"), "pending")));
    }

    #[test]
    fn tool_events_without_state_are_discarded() {
        assert!(reduce(None, &tool_call(Some("job-1"), "q"), &thread(), at(0)).is_none());
        assert!(reduce(None, &tool_result(Some("job-1"), true), &thread(), at(0)).is_none());
    }

    #[test]
    fn activity_is_append_only_and_keeps_duplicates() {
        let mut state = running_state(Some("job-1"));
        let sequence = [
            tool_call(Some("job-1"), "rust async"),
            tool_call(Some("job-1"), "rust async"),
            tool_result(Some("job-1"), true),
            tool_result(None, false),
        ];
        let mut previous_len = 0;
        for (offset, next_event) in sequence.iter().enumerate() {
            state = reduce(Some(&state), next_event, &thread(), at(0)).expect("state");
            assert!(state.activity.len() > previous_len, "step {offset}");
            previous_len = state.activity.len();
        }
        assert_eq!(state.activity.len(), 4);
        assert_eq!(state.activity[0].query, state.activity[1].query);
        assert_ne!(state.activity[0].id, state.activity[1].id);
        assert_eq!(state.activity[2].kind, ActivityKind::ToolResult);
        assert_eq!(state.activity[2].found, Some(true));
        assert_eq!(state.current_phase, JobPhase::Searching);
    }

    #[test]
    fn tool_result_does_not_move_phase() {
        let state = running_state(Some("job-1"));
        let next = reduce(Some(&state), &tool_result(Some("job-1"), true), &thread(), at(1))
            .expect("state");
        assert_eq!(next.current_phase, JobPhase::Initializing);
        assert_eq!(next.activity.len(), 1);
    }

    #[test]
    fn plan_then_chunk_moves_planning_to_responding() {
        let state = running_state(Some("job-1"));
        let planned = reduce(Some(&state), &plan("Searching docs"), &thread(), at(1)).expect("state");
        assert_eq!(planned.current_phase, JobPhase::Planning);
        assert_eq!(planned.current_action.as_deref(), Some("Searching docs"));
        assert_eq!(planned.acknowledgment.as_deref(), Some("Searching docs"));

        let responding = reduce(Some(&planned), &chunk(""), &thread(), at(2)).expect("state");
        assert_eq!(responding.current_phase, JobPhase::Responding);
        assert_eq!(responding.current_action, None);
        assert_eq!(responding.acknowledgment.as_deref(), Some("Searching docs"));

        let again = reduce(Some(&responding), &chunk("more"), &thread(), at(3)).expect("state");
        assert!(Arc::ptr_eq(&responding, &again));
    }

    #[test]
    fn empty_acknowledgment_is_ignored() {
        let state = running_state(Some("job-1"));
        let next = reduce(Some(&state), &plan("   "), &thread(), at(1)).expect("state");
        assert!(Arc::ptr_eq(&state, &next));
    }

    #[test]
    fn responding_does_not_regress_to_searching_or_planning() {
        let state = running_state(Some("job-1"));
        let responding = reduce(Some(&state), &chunk("a"), &thread(), at(1)).expect("state");
        let after_tool = reduce(Some(&responding), &tool_call(Some("job-1"), "late"), &thread(), at(2))
            .expect("state");
        assert_eq!(after_tool.current_phase, JobPhase::Responding);
        assert_eq!(after_tool.activity.len(), 1);

        let after_plan = reduce(Some(&after_tool), &plan("Late plan"), &thread(), at(3)).expect("state");
        assert_eq!(after_plan.current_phase, JobPhase::Responding);
        assert_eq!(after_plan.current_action, None);
        assert_eq!(after_plan.acknowledgment.as_deref(), Some("Late plan"));
    }

    #[test]
    fn terminal_status_finishes_the_job() {
        let state = running_state(Some("job-1"));
        let done = reduce(Some(&state), &status(Some("job-1"), "completed"), &thread(), at(1))
            .expect("state");
        assert_eq!(done.current_phase, JobPhase::Done);
        assert_eq!(done.status, JobStatus::Completed);

        let repeated = reduce(Some(&done), &status(Some("job-1"), "completed"), &thread(), at(2))
            .expect("state");
        assert!(Arc::ptr_eq(&done, &repeated));

        let late_chunk = reduce(Some(&done), &chunk("late"), &thread(), at(3)).expect("state");
        assert!(Arc::ptr_eq(&done, &late_chunk));

        let failed = reduce(Some(&state), &status(None, "failed"), &thread(), at(1)).expect("state");
        assert_eq!(failed.current_phase, JobPhase::Error);
    }

    #[test]
    fn error_event_sets_error_phase() {
        let state = running_state(Some("job-1"));
        let errored = reduce(
            Some(&state),
            &event(
                Some("job-1"),
                JobEventBody::Error {
                    message: Some("search backend unavailable".to_string()),
                },
            ),
            &thread(),
            at(1),
        )
        .expect("state");
        assert_eq!(errored.current_phase, JobPhase::Error);
        assert_eq!(
            errored.current_action.as_deref(),
            Some("search backend unavailable")
        );
    }

    #[test]
    fn unknown_events_pass_through() {
        let state = running_state(Some("job-1"));
        let next = reduce(Some(&state), &event(Some("job-1"), JobEventBody::Unknown), &thread(), at(1))
            .expect("state");
        assert!(Arc::ptr_eq(&state, &next));
        assert!(reduce(None, &event(None, JobEventBody::Unknown), &thread(), at(1)).is_none());
    }

    #[test]
    fn accumulate_appends_text_and_replaces_sources() {
        let state = running_state(Some("job-1"));
        let first = accumulate(Some(&state), &chunk("Hello")).expect("state");
        let second = accumulate(Some(&first), &chunk(", world")).expect("state");
        assert_eq!(second.content, "Hello, world");
        assert_eq!(second.current_phase, JobPhase::Initializing);

        let thought = accumulate(
            Some(&second),
            &event(
                Some("job-1"),
                JobEventBody::Thinking {
                    content: "compare sources".to_string(),
                },
            ),
        )
        .expect("state");
        assert_eq!(thought.thinking.as_deref(), Some("compare sources"));

        let sources = vec![crate::Source {
            title: Some("Tokio docs".to_string()),
            url: Some("https://tokio.rs".to_string()),
            snippet: None,
            extra: Default::default(),
        }];
        let cited = accumulate(
            Some(&thought),
            &event(
                Some("job-1"),
                JobEventBody::Sources {
                    sources: sources.clone(),
                },
            ),
        )
        .expect("state");
        assert_eq!(cited.sources, sources);

        let same = accumulate(
            Some(&cited),
            &event(Some("job-1"), JobEventBody::Sources { sources }),
        )
        .expect("state");
        assert!(Arc::ptr_eq(&cited, &same));
    }

    #[test]
    fn accumulate_without_state_yields_nothing() {
        assert!(accumulate(None, &chunk("orphan")).is_none());
    }
}
