//! FileBro backend daemon.
//!
//! Serves file-browser clients over JSON-RPC, resolves paths through the
//! driver registry, broadcasts debounced changes and runs CPU-heavy tasks in
//! a pool of `filebro-worker` processes.

pub mod navigation;
pub mod outbound;
pub mod rpc_helpers;
pub mod scheduler;
pub mod server;
pub mod session_manager;
pub mod tasks;
pub mod worker;
pub mod worker_pool;

pub use navigation::NavigationHistory;
pub use outbound::OutboundQueue;
pub use scheduler::{SchedulerError, SchedulerSettings, SchedulerStats, TaskInfo, TaskScheduler};
pub use server::{Daemon, Server};
pub use session_manager::{Dispatch, SessionError, SessionManager};
pub use worker_pool::{PoolSettings, PoolStatus, SlotState, WorkerError, WorkerPool};
