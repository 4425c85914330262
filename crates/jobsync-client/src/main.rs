use clap::Parser;
use jobsync_client::logging::init_logging;
use jobsync_client::{load_config, ConfigFlags, JobSync};
use jobsync_core::{JobPhase, JobStatus};
use std::error::Error;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "jobsync-watch")]
struct Args {
    /// Job source websocket url (falls back to JOBSYNC_URL).
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    project: String,
    #[arg(long, default_value = "")]
    thread: String,
    #[arg(long)]
    initial_backoff_ms: Option<u64>,
    #[arg(long)]
    max_backoff_secs: Option<u64>,
    /// Largest inbound frame accepted, in bytes (falls back to JOBSYNC_MAX_FRAME_BYTES).
    #[arg(long)]
    max_frame_bytes: Option<usize>,
}

impl Args {
    fn config_flags(&self) -> ConfigFlags {
        ConfigFlags {
            url: self.url.clone(),
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_secs: self.max_backoff_secs,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// What the watcher last reported, so it only logs transitions.
#[derive(Debug, Default, PartialEq)]
struct Observed {
    connected: bool,
    live: bool,
    active_jobs: usize,
    job_id: Option<String>,
    status: Option<JobStatus>,
    phase: Option<JobPhase>,
    action: Option<String>,
    activity: usize,
    content_len: usize,
}

impl Observed {
    fn capture(sync: &JobSync) -> Self {
        let state = sync.current_job_state();
        Self {
            connected: sync.ws_connected(),
            live: sync.is_live(),
            active_jobs: sync.active_job_index().active_count(),
            job_id: state.and_then(|s| s.job_id.clone()),
            status: state.map(|s| s.status),
            phase: state.map(|s| s.current_phase),
            action: state.and_then(|s| s.current_action.clone()),
            activity: state.map(|s| s.activity.len()).unwrap_or(0),
            content_len: state.map(|s| s.content.len()).unwrap_or(0),
        }
    }
}

fn report(previous: &Observed, next: &Observed) {
    if previous.connected != next.connected {
        info!(event = "connectivity", connected = next.connected);
    }
    if previous.active_jobs != next.active_jobs {
        info!(event = "active_jobs", count = next.active_jobs);
    }
    if previous.phase != next.phase || previous.status != next.status || previous.job_id != next.job_id {
        info!(
            event = "job",
            job_id = ?next.job_id,
            status = ?next.status.map(|s| s.as_str()),
            phase = ?next.phase.map(|p| p.as_str()),
            live = next.live,
        );
    }
    if previous.action != next.action {
        if let Some(action) = next.action.as_deref() {
            info!(event = "action", action);
        }
    }
    if previous.activity != next.activity {
        info!(event = "activity", entries = next.activity);
    }
    if previous.content_len != next.content_len {
        info!(event = "content", bytes = next.content_len);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging();

    let config = load_config(&args.config_flags())?;
    info!(event = "starting", url = %config.url);

    let mut sync = JobSync::new(config);
    sync.start();

    let project = args.project.trim();
    let thread = args.thread.trim();
    match (project.is_empty(), thread.is_empty()) {
        (false, false) => sync.subscribe_thread(project, thread),
        (true, true) => {}
        _ => warn!(event = "subscription_skipped", reason = "need both --project and --thread"),
    }

    let mut observed = Observed::capture(&sync);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            change = sync.next_change() => {
                if change.is_none() {
                    break;
                }
                sync.drain_pending();
                let next = Observed::capture(&sync);
                report(&observed, &next);
                observed = next;
            }
            _ = &mut ctrl_c => {
                info!(event = "interrupted");
                break;
            }
        }
    }

    sync.shutdown().await;
    Ok(())
}
