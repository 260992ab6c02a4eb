//! Supervised worker threads and the roles that run on them.

pub mod connection;
pub mod listener;
pub mod logic;
pub mod registry;
pub mod serial_io;
pub mod watchdog;
pub mod worker;

pub use registry::{StallReason, ThreadRecord, ThreadRegistry, ThreadState, ThreadStatus, WorkerExit};
pub use watchdog::{RestartPolicy, Supervised, Watchdog, WatchdogHandle};
pub use worker::{spawn, Step, Worker, WorkerContext, WorkerError, WorkerFactory, WorkerHandle};
