//! # hvacd
//!
//! Control daemon for an HVAC installation driven through a serial-connected
//! I/O board. Board telemetry lands in a versioned state cache, a control loop
//! turns set points into board commands, and clients (an HMI, a data logger)
//! query and subscribe over a local socket. Every role runs on its own
//! supervised thread under a watchdog that detects hung or crashed workers and
//! restarts them within a budget.
//!
//! ## Features
//!
//! - **Framed protocol**: one 9-byte-header envelope for the board link and the client sockets
//! - **Watchdog supervision**: heartbeat deadlines, cooperative then forced termination, restart budgets
//! - **Control loop**: heat/cool hysteresis and tracking rules evaluated at a fixed cadence
//! - **Board link**: TCP (ser2net, `board-sim`) or native serial port behind the `serial` feature
//! - **Bounded queues**: freshest-wins command queue and alert history with fixed capacity
//!
//! ## Quick Start
//!
//! ```no_run
//! use hvacd::Daemon;
//!
//! let mut daemon = Daemon::from_config_file("hvac.json")?;
//! daemon.start()?;
//!
//! while daemon.is_healthy() {
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! daemon.graceful_stop();
//! # Ok::<(), hvacd::daemon::DaemonError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`daemon`] - Process lifecycle and wiring of the supervised roles
//! - [`threads`] - Worker base, registry, watchdog, serial I/O, logic, listener
//! - [`protocol`] / [`payload`] - Frame codec and message bodies
//! - [`cache`] - Versioned board state
//! - [`config`] / [`settings`] - Installation definition and runtime tuning
//! - [`client`] - Async client used by `hvacctl` and `hvac-logger`
//! - [`datalog`] - Record sinks for persisted telemetry

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod alert;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod daemon;
pub mod datalog;
pub mod link;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod rules;
pub mod settings;
pub mod threads;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export main public types for convenience
pub use cache::{BoardStateCache, CacheEntry, Snapshot};
pub use config::{BoardPoint, Configurator, SetPoint};
pub use daemon::Daemon;
pub use protocol::{Message, MessageType, ProtocolError};
pub use settings::Settings;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
