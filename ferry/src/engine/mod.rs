//! Job orchestration engine.
//!
//! Producers (the manual API, Scheduler, Event Monitor and Chain Job Service)
//! store jobs and hand their ids to the work queue through the [`Dispatcher`].
//! The worker pool claims ids and runs each job through the executor, taking a
//! throttle slot per file against the destination endpoint.

pub mod chain;
pub mod dispatch;
pub mod events;
pub mod manager;
pub mod planner;
pub mod progress;
pub mod runner;
pub mod service;
pub mod throttle;
pub mod work_queue;
pub mod worker_pool;

pub use chain::{ChainJobService, LandedFile};
pub use dispatch::Dispatcher;
pub use events::{EngineEvent, EventBus};
pub use manager::Engine;
pub use runner::{JobRunner, RunnerSettings};
pub use service::{JobService, NewJob, NewSchedule};
pub use throttle::{
    Admission, MemorySlotStore, SlotGuard, SlotStore, SqliteSlotStore, ThrottleController,
    ThrottleEvent,
};
pub use work_queue::{Claim, MemoryWorkQueue, SqliteWorkQueue, WorkQueue};
pub use worker_pool::WorkerPool;
