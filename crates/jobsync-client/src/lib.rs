//! Client side of the job-state sync protocol: one websocket to the job
//! source, a subscription to at most one thread, and a locally consistent
//! mirror of that thread's job plus workspace-wide active-job badges.

pub mod config;
pub mod connection;
pub mod facade;
pub mod logging;
pub mod state;
pub mod subscription;

pub use config::{load_config, ClientConfig, ConfigError, ConfigFlags};
pub use connection::{ConnectionEvent, ConnectionManager, EventSink};
pub use facade::JobSync;
pub use state::SyncState;
pub use subscription::SubscriptionRegistry;
