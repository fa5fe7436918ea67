//! Event Monitor: turns external change notifications into jobs.
//!
//! Two trigger sources feed one handler: a polling filesystem watcher for
//! templates whose source endpoint is a local directory, and remote event
//! queues delivering object notifications. Every event is matched against the
//! active templates, and each match becomes an `event_triggered` job scoped to
//! the one file.

pub mod dedup;
pub mod events;
pub mod fs_watch;
pub mod remote;
pub mod service;

pub use dedup::RecentEvents;
pub use events::{ChangeEvent, ChangeKind};
pub use fs_watch::{FsEvent, FsWatcher};
pub use remote::{MemoryRemoteEventQueue, RemoteEventQueue, RemoteObjectEvent};
pub use service::EventMonitor;
