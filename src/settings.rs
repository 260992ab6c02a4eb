//! Runtime tuning. Every field has a default so the `settings` block of the
//! configuration file may be partial or absent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::config::ConfigError;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::threads::watchdog::{RestartPolicy, MAX_RESTART_HISTORY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub watchdog: WatchdogSettings,
    pub serial: SerialSettings,
    pub logic: LogicSettings,
    pub listener: ListenerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub poll_interval_ms: u64,
    /// Time a fresh worker has to produce its first heartbeat.
    pub grace_period_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Time a stalled worker has to honour a stop request.
    pub stop_grace_period_ms: u64,
    pub max_restarts: u32,
    pub restart_window_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            grace_period_ms: 2_000,
            heartbeat_timeout_ms: 2_000,
            stop_grace_period_ms: 1_000,
            max_restarts: 3,
            restart_window_ms: 60_000,
        }
    }
}

impl WatchdogSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Budget {
            max_restarts: self.max_restarts,
            window: Duration::from_millis(self.restart_window_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// `tcp://host:port` or `serial:///dev/ttyS1?baud=115200`.
    pub endpoint: String,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub min_command_spacing_ms: u64,
    pub max_frame_size: usize,
    pub backoff: Backoff,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:7000".to_string(),
            read_timeout_ms: 50,
            write_timeout_ms: 500,
            min_command_spacing_ms: 20,
            max_frame_size: 4_096,
            backoff: Backoff::default(),
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn min_command_spacing(&self) -> Duration {
        Duration::from_millis(self.min_command_spacing_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicSettings {
    pub tick_ms: u64,
}

impl Default for LogicSettings {
    fn default() -> Self {
        Self { tick_ms: 500 }
    }
}

impl LogicSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// `tcp://host:port` or `unix:///path/to/socket`.
    pub address: String,
    pub max_frame_size: usize,
    pub accept_poll_ms: u64,
    pub read_timeout_ms: u64,
    /// A client that stops draining its socket for this long is dropped.
    pub write_timeout_ms: u64,
    pub client_heartbeat_ms: u64,
    pub client_timeout_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            address: "unix:///tmp/bbb_hvac".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_poll_ms: 50,
            read_timeout_ms: 50,
            write_timeout_ms: 1_000,
            client_heartbeat_ms: 5_000,
            client_timeout_ms: 15_000,
        }
    }
}

impl ListenerSettings {
    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn client_heartbeat(&self) -> Duration {
        Duration::from_millis(self.client_heartbeat_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidSettings(format!("{field} must be greater than zero")))
    } else {
        Ok(())
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.watchdog;
        require_positive("watchdog.poll_interval_ms", w.poll_interval_ms)?;
        require_positive("watchdog.grace_period_ms", w.grace_period_ms)?;
        require_positive("watchdog.heartbeat_timeout_ms", w.heartbeat_timeout_ms)?;
        require_positive("watchdog.restart_window_ms", w.restart_window_ms)?;
        if w.max_restarts as usize > MAX_RESTART_HISTORY {
            return Err(ConfigError::InvalidSettings(format!(
                "watchdog.max_restarts may not exceed {MAX_RESTART_HISTORY}"
            )));
        }

        require_positive("serial.read_timeout_ms", self.serial.read_timeout_ms)?;
        require_positive("serial.write_timeout_ms", self.serial.write_timeout_ms)?;
        require_positive("serial.backoff.base_ms", self.serial.backoff.base_ms)?;
        if self.serial.backoff.max_ms < self.serial.backoff.base_ms {
            return Err(ConfigError::InvalidSettings(
                "serial.backoff.max_ms must be at least base_ms".to_string(),
            ));
        }

        require_positive("logic.tick_ms", self.logic.tick_ms)?;

        let l = &self.listener;
        require_positive("listener.accept_poll_ms", l.accept_poll_ms)?;
        require_positive("listener.read_timeout_ms", l.read_timeout_ms)?;
        require_positive("listener.write_timeout_ms", l.write_timeout_ms)?;
        require_positive("listener.client_heartbeat_ms", l.client_heartbeat_ms)?;
        if l.client_timeout_ms <= l.client_heartbeat_ms {
            return Err(ConfigError::InvalidSettings(
                "listener.client_timeout_ms must exceed client_heartbeat_ms".to_string(),
            ));
        }
        if l.max_frame_size == 0 || self.serial.max_frame_size == 0 {
            return Err(ConfigError::InvalidSettings(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
