//! Shared protocol types for the FileBro daemon.
//!
//! Three wire surfaces live here:
//! - client <-> daemon: newline-delimited JSON-RPC 2.0 requests/responses plus
//!   server-initiated [`EventMessage`]s
//! - daemon <-> worker: [`WorkerInstruction`]s on the worker's stdin and
//!   [`WorkerRecord`]s on its stdout
//! - task specs: the closed set of task types a client may start

mod events;
mod lifecycle;
mod protocol;
mod session;
mod task;
mod types;
mod worker;

pub use events::{EventMessage, Progress, ServerEvent};
pub use lifecycle::{
    pid_path, remove_pid_file, remove_socket, socket_path, write_pid_file, SOCKET_ENV,
};
pub use protocol::{
    methods, Reason, Request, RequestId, Response, RpcError, INTERNAL_ERROR, INVALID_PARAMS,
    INVALID_PATH, INVALID_REQUEST, IO_FAILURE, METHOD_NOT_FOUND, NOT_FOUND, NOT_SUPPORTED,
    PARSE_ERROR, PERMISSION_DENIED, TASK_NOT_FOUND, TASK_REJECTED,
};
pub use session::{Outbound, SessionId};
pub use task::{AdmissionError, HashAlgorithm, TaskDescriptor, TaskId, TaskSpec, TaskState};
pub use types::{ChangeKind, Entry, EntryKind, PathChange};
pub use worker::{WorkerInstruction, WorkerRecord};
