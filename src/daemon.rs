use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::alert::AlertLog;
use crate::cache::BoardStateCache;
use crate::config::{ConfigError, Configurator};
use crate::link::{connector_for, LinkConnector};
use crate::queue::CommandQueue;
use crate::settings::Settings;
use crate::threads::connection::ClientServices;
use crate::threads::listener::{ListenerWorker, LISTENER_WORKER_NAME};
use crate::threads::logic::{LogicStatus, LogicWorker, SharedLogicStatus, LOGIC_WORKER_NAME};
use crate::threads::serial_io::{SerialIoWorker, SERIAL_WORKER_NAME};
use crate::threads::watchdog::{Supervised, Watchdog, WatchdogError, WatchdogHandle};
use crate::threads::{ThreadRegistry, Worker, WorkerError, WorkerFactory};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error("failed to start watchdog thread: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon is already running")]
    AlreadyRunning,
}

/// The control daemon: shared state plus the supervised serial I/O, logic
/// and listener roles.
pub struct Daemon {
    settings: Settings,
    connector: Arc<dyn LinkConnector>,

    // Shared state
    config: Arc<Configurator>,
    cache: Arc<BoardStateCache>,
    queue: Arc<CommandQueue>,
    registry: Arc<ThreadRegistry>,
    alerts: Arc<AlertLog>,
    logic_status: SharedLogicStatus,
    services: Arc<ClientServices>,

    // Lifecycle
    watchdog: Option<WatchdogHandle>,
    started_at: Option<Instant>,
}

impl Daemon {
    pub fn new(
        settings: Settings,
        config: Configurator,
        connector: Arc<dyn LinkConnector>,
    ) -> Result<Self, DaemonError> {
        settings.validate()?;

        let config = Arc::new(config);
        let cache = Arc::new(BoardStateCache::from_config(&config));
        let registry = Arc::new(ThreadRegistry::new());
        let alerts = Arc::new(AlertLog::new());
        let queue = Arc::new(CommandQueue::new());
        let logic_status: SharedLogicStatus = Arc::new(RwLock::new(LogicStatus::default()));
        let services = Arc::new(ClientServices::new(
            Arc::clone(&cache),
            Arc::clone(&config),
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&alerts),
            Arc::clone(&logic_status),
            settings.listener.clone(),
        ));

        Ok(Self {
            settings,
            connector,
            config,
            cache,
            queue,
            registry,
            alerts,
            logic_status,
            services,
            watchdog: None,
            started_at: None,
        })
    }

    /// Loads the configuration file and connects to the board endpoint it names.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let (settings, config) = Configurator::load(path)?;
        let connector = connector_for(
            &settings.serial.endpoint,
            settings.serial.read_timeout(),
            settings.serial.write_timeout(),
        )?;
        Self::new(settings, config, Arc::from(connector))
    }

    pub fn start(&mut self) -> Result<(), DaemonError> {
        if self.watchdog.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        let policy = self.settings.watchdog.restart_policy();
        let mut watchdog = Watchdog::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.alerts),
            self.settings.watchdog.clone(),
        );

        let roles = [
            (SERIAL_WORKER_NAME, self.serial_factory(), true),
            (LOGIC_WORKER_NAME, self.logic_factory(), false),
            (LISTENER_WORKER_NAME, self.listener_factory(), false),
        ];
        for (name, factory, critical) in roles {
            let supervised = watchdog.supervise(Supervised {
                name: name.to_string(),
                factory,
                policy,
                critical,
            });
            if let Err(err) = supervised {
                self.stop_workers();
                return Err(err.into());
            }
        }

        self.watchdog = Some(watchdog.spawn()?);
        self.started_at = Some(Instant::now());
        info!(
            link = %self.connector.describe(),
            listen = %self.listen_address().unwrap_or_default(),
            "hvacd started"
        );
        Ok(())
    }

    fn serial_factory(&self) -> WorkerFactory {
        let connector = Arc::clone(&self.connector);
        let cache = Arc::clone(&self.cache);
        let config = Arc::clone(&self.config);
        let queue = Arc::clone(&self.queue);
        let alerts = Arc::clone(&self.alerts);
        let settings = self.settings.serial.clone();
        Arc::new(move || -> Result<Box<dyn Worker>, WorkerError> {
            Ok(Box::new(SerialIoWorker::new(
                Arc::clone(&connector),
                Arc::clone(&cache),
                Arc::clone(&config),
                Arc::clone(&queue),
                Arc::clone(&alerts),
                settings.clone(),
            )))
        })
    }

    fn logic_factory(&self) -> WorkerFactory {
        let config = Arc::clone(&self.config);
        let cache = Arc::clone(&self.cache);
        let queue = Arc::clone(&self.queue);
        let status = Arc::clone(&self.logic_status);
        let tick = self.settings.logic.tick();
        Arc::new(move || -> Result<Box<dyn Worker>, WorkerError> {
            Ok(Box::new(LogicWorker::new(
                Arc::clone(&config),
                Arc::clone(&cache),
                Arc::clone(&queue),
                Arc::clone(&status),
                tick,
            )))
        })
    }

    fn listener_factory(&self) -> WorkerFactory {
        let services = Arc::clone(&self.services);
        Arc::new(move || -> Result<Box<dyn Worker>, WorkerError> {
            Ok(Box::new(ListenerWorker::bind(Arc::clone(&services))?))
        })
    }

    fn stop_workers(&self) -> bool {
        self.registry.request_stop_all();
        let grace = self.settings.watchdog.stop_grace_period() + Duration::from_millis(500);
        self.registry.wait_all_stopped(grace)
    }

    /// Stops supervision, then asks every worker to leave its loop and waits
    /// for them up to the stop grace period.
    pub fn graceful_stop(&mut self) {
        let Some(mut watchdog) = self.watchdog.take() else {
            return;
        };
        info!("hvacd stopping");
        watchdog.stop();

        if self.stop_workers() {
            info!("all workers stopped");
        } else {
            for record in self.registry.snapshot() {
                if record.handle.is_alive() {
                    warn!(worker = %record.name, "worker did not stop in time, detaching it");
                }
            }
        }
        self.started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.watchdog.is_some()
    }

    /// False once a critical role has exhausted its restart budget or the
    /// watchdog itself died.
    pub fn is_healthy(&self) -> bool {
        let watchdog_ok = self.watchdog.as_ref().map_or(true, WatchdogHandle::is_running);
        watchdog_ok && self.alerts.is_healthy()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn listen_address(&self) -> Option<String> {
        self.services.bound_address()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config(&self) -> &Arc<Configurator> {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BoardStateCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    pub fn logic_status(&self) -> LogicStatus {
        self.logic_status
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.graceful_stop();
    }
}
