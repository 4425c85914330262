//! Owns the single websocket to the job source.
//!
//! The transport runs on one tokio task. Inbound frames are decoded there and
//! forwarded, in arrival order, to whichever sink is registered through
//! [`ConnectionManager::set_callbacks`]. The sink is an unbounded channel so
//! delivery never stalls the read loop.

use crate::config::ClientConfig;
use crate::subscription::SubscriptionRegistry;
use futures_util::{SinkExt, StreamExt};
use jobsync_core::wire::{decode_inbound, encode_control};
use jobsync_core::{InboundFrame, JobEvent, JobInfo, JobStateFrame, OutboundFrame, ThreadRef};
use rand_core::{OsRng, RngCore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the transport reports, one variant per callback slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ActiveJobs(Vec<JobInfo>),
    JobUpdate(JobInfo),
    JobState {
        project_id: Option<String>,
        thread_id: Option<String>,
        state: Option<JobStateFrame>,
    },
    JobEvent(JobEvent),
    Connection(bool),
}

impl From<InboundFrame> for ConnectionEvent {
    fn from(frame: InboundFrame) -> Self {
        match frame {
            InboundFrame::ActiveJobs { jobs } => ConnectionEvent::ActiveJobs(jobs),
            InboundFrame::JobUpdate { job } => ConnectionEvent::JobUpdate(job),
            InboundFrame::JobState {
                project_id,
                thread_id,
                state,
            } => ConnectionEvent::JobState {
                project_id,
                thread_id,
                state,
            },
            InboundFrame::JobEvent { event } => ConnectionEvent::JobEvent(event),
        }
    }
}

pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

struct Shared {
    sink: Mutex<Option<EventSink>>,
    registry: Mutex<SubscriptionRegistry>,
    connected: AtomicBool,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        let sink = lock(&self.sink);
        match sink.as_ref() {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!(event = "sink_closed");
                }
            }
            None => debug!(event = "frame_without_sink"),
        }
    }

    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            self.emit(ConnectionEvent::Connection(connected));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

pub struct ConnectionManager {
    config: ClientConfig,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                sink: Mutex::new(None),
                registry: Mutex::new(SubscriptionRegistry::new()),
                connected: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn set_callbacks(&self, sink: EventSink) {
        *lock(&self.shared.sink) = Some(sink);
    }

    pub fn clear_callbacks(&self) {
        lock(&self.shared.sink).take();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// True while the transport task is connecting, connected or waiting to
    /// retry.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.handle.is_finished())
            .unwrap_or(false)
    }

    /// Starts the transport task. A no-op while one is already running.
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        if self.is_running() {
            debug!(event = "connect_noop", url = %self.config.url);
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(link_loop(
            self.config.clone(),
            self.shared.clone(),
            outbound_rx,
            shutdown_rx,
        ));
        self.worker = Some(Worker {
            handle,
            shutdown: shutdown_tx,
            outbound: outbound_tx,
        });
    }

    /// Stops the transport, cancelling any pending reconnect, and waits for
    /// the task to finish.
    pub async fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
            drop(worker.outbound);
            if let Err(err) = worker.handle.await {
                warn!(event = "link_join_error", error = %err);
            }
        }
        self.shared.set_connected(false);
    }

    pub fn subscribe_thread(&self, thread: ThreadRef) {
        let frame = lock(&self.shared.registry).subscribe(thread);
        self.send_control(frame);
    }

    pub fn unsubscribe_thread(&self) {
        let frame = lock(&self.shared.registry).unsubscribe();
        if let Some(frame) = frame {
            self.send_control(frame);
        }
    }

    pub fn current_subscription(&self) -> Option<ThreadRef> {
        lock(&self.shared.registry).current().cloned()
    }

    fn send_control(&self, frame: OutboundFrame) {
        // While the link is down the registry replay covers this frame.
        if !self.is_connected() {
            debug!(event = "control_deferred", frame = ?frame);
            return;
        }
        if let Some(worker) = self.worker.as_ref() {
            if worker.outbound.send(frame).is_err() {
                debug!(event = "control_dropped");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
        }
    }
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

async fn link_loop(
    config: ClientConfig,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = config.initial_backoff;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let connect = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = shutdown_rx.changed() => break,
        };
        let ws = match connect {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!(event = "connect_error", url = %config.url, error = %err);
                let delay = with_jitter(backoff, config.jitter_ratio, OsRng.next_u32());
                if !pause(&mut shutdown_rx, delay).await {
                    break;
                }
                backoff = next_backoff(backoff, config.max_backoff);
                continue;
            }
        };
        backoff = config.initial_backoff;
        info!(event = "connected", url = %config.url);

        // Frames queued before the drop are superseded by the replay.
        while outbound_rx.try_recv().is_ok() {}

        let end = run_session(&config, &shared, ws, &mut outbound_rx, &mut shutdown_rx).await;
        shared.set_connected(false);
        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped => {
                info!(event = "disconnected", url = %config.url);
                let delay = with_jitter(backoff, config.jitter_ratio, OsRng.next_u32());
                if !pause(&mut shutdown_rx, delay).await {
                    break;
                }
                backoff = next_backoff(backoff, config.max_backoff);
            }
        }
    }
    shared.set_connected(false);
    info!(event = "link_stopped");
}

async fn run_session(
    config: &ClientConfig,
    shared: &Shared,
    mut ws: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    // Flag first, replay second: a subscribe racing with the handshake is
    // either queued behind the flag or picked up by the replay.
    shared.set_connected(true);
    let replay = lock(&shared.registry).replay();
    if let Some(frame) = replay {
        if send_frame(&mut ws, &frame).await.is_err() {
            warn!(event = "replay_error");
            return SessionEnd::Dropped;
        }
        info!(event = "subscription_replayed", frame = ?frame);
    }

    loop {
        tokio::select! {
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch_text(shared, &text, config.max_frame_bytes),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch_text(shared, &text, config.max_frame_bytes),
                        Err(_) => warn!(event = "frame_dropped", reason = "binary_not_utf8"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(event = "server_closed", frame = ?frame);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "read_error", error = %err);
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if send_frame(&mut ws, &frame).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = ws.close(None).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

fn dispatch_text(shared: &Shared, text: &str, max_frame_bytes: usize) {
    match decode_inbound(text, max_frame_bytes) {
        Ok(frame) => shared.emit(ConnectionEvent::from(frame)),
        Err(err) => warn!(event = "frame_dropped", error = %err),
    }
}

async fn send_frame(ws: &mut Socket, frame: &OutboundFrame) -> Result<(), ()> {
    let text = match encode_control(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "control_encode_error", error = %err);
            return Ok(());
        }
    };
    ws.send(Message::Text(text)).await.map_err(|err| {
        warn!(event = "send_error", error = %err);
    })
}

/// Sleeps for `delay` unless shutdown is signalled first. Returns false on
/// shutdown.
async fn pause(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => !*shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => false,
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

/// Adds up to `ratio * base` of extra delay, scaled by `roll / u32::MAX`.
fn with_jitter(base: Duration, ratio: f64, roll: u32) -> Duration {
    let ratio = if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let fraction = f64::from(roll) / f64::from(u32::MAX);
    base + base.mul_f64(ratio * fraction)
}
