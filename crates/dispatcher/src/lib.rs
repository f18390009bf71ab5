//! Multi-process plumbing: handing accepted sockets from the dispatcher
//! process to a worker, and supervising the worker fleet.

pub mod handoff;
pub mod supervisor;

pub use handoff::{
    recv_handoff,
    send_handoff,
    HandoffFrame,
    SerializedRequest,
};
pub use supervisor::{
    Supervisor,
    WorkerKind,
};
