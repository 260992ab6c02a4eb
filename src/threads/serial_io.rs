use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::worker::{Step, Worker, WorkerContext, WorkerError};
use crate::alert::{Alert, AlertLog};
use crate::cache::BoardStateCache;
use crate::config::{Configurator, Direction};
use crate::link::{BoardLink, LinkConnector, LinkError};
use crate::now_millis;
use crate::payload::{BoardCommand, ErrorPayload, TelemetryPayload};
use crate::protocol::{
    dispatch, encode, CorrelationIds, FrameDecoder, Message, MessageHandler, MessageType,
    ProtocolError,
};
use crate::queue::CommandQueue;
use crate::settings::SerialSettings;

pub const SERIAL_WORKER_NAME: &str = "serial-io";

/// Bytes pulled from the link per read.
pub const READ_CHUNK: usize = 256;

/// Applies board frames to the cache.
struct BoardInbox<'a> {
    cache: &'a BoardStateCache,
    config: &'a Configurator,
    echoes: Vec<u32>,
}

impl MessageHandler for BoardInbox<'_> {
    fn on_board_telemetry(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let telemetry: TelemetryPayload = message.parse_json()?;
        let timestamp_ms = if telemetry.timestamp_ms == 0 {
            now_millis()
        } else {
            telemetry.timestamp_ms
        };

        for reading in &telemetry.readings {
            let value = self
                .config
                .point(&reading.point_id)
                .map_or(reading.value, |p| p.scaling.to_engineering(reading.value));
            self.cache
                .update_raw(&reading.point_id, value, reading.value, timestamp_ms);
        }
        Ok(())
    }

    fn on_heartbeat(&mut self, message: &Message) -> Result<(), ProtocolError> {
        self.echoes.push(message.correlation);
        Ok(())
    }

    fn on_error(&mut self, message: &Message) -> Result<(), ProtocolError> {
        match message.parse_json::<ErrorPayload>() {
            Ok(report) => warn!(%report, "board reported an error"),
            Err(_) => warn!(bytes = message.payload.len(), "board reported an unreadable error"),
        }
        Ok(())
    }
}

/// Owns the board link: telemetry in, queued commands out.
pub struct SerialIoWorker {
    connector: Arc<dyn LinkConnector>,
    cache: Arc<BoardStateCache>,
    config: Arc<Configurator>,
    queue: Arc<CommandQueue>,
    alerts: Arc<AlertLog>,
    settings: SerialSettings,
    link: Option<Box<dyn BoardLink>>,
    decoder: FrameDecoder,
    correlations: CorrelationIds,
    failed_attempts: u32,
    last_command_at: Option<Instant>,
}

impl SerialIoWorker {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        cache: Arc<BoardStateCache>,
        config: Arc<Configurator>,
        queue: Arc<CommandQueue>,
        alerts: Arc<AlertLog>,
        settings: SerialSettings,
    ) -> Self {
        let decoder = FrameDecoder::new(settings.max_frame_size);
        Self {
            connector,
            cache,
            config,
            queue,
            alerts,
            settings,
            link: None,
            decoder,
            correlations: CorrelationIds::new(),
            failed_attempts: 0,
            last_command_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Returns `Ok(false)` when a stop request interrupted the backoff.
    fn reconnect(&mut self, ctx: &WorkerContext) -> Result<bool, WorkerError> {
        let backoff = self.settings.backoff;
        loop {
            if self.failed_attempts > 0 {
                if backoff.exhausted(self.failed_attempts) {
                    self.alerts.raise(
                        Alert::LinkRetriesExhausted {
                            link: self.connector.describe(),
                            attempts: self.failed_attempts,
                        },
                        false,
                    );
                    return Err(LinkError::RetriesExhausted {
                        attempts: self.failed_attempts,
                    }
                    .into());
                }
                let delay = backoff.delay(self.failed_attempts);
                debug!(attempt = self.failed_attempts, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                if !ctx.sleep(delay) {
                    return Ok(false);
                }
            }

            match self.connector.connect() {
                Ok(link) => {
                    info!(link = %self.connector.describe(), "board link up");
                    self.link = Some(link);
                    self.decoder.reset();
                    return Ok(true);
                }
                Err(err) => {
                    self.failed_attempts += 1;
                    warn!(
                        link = %self.connector.describe(),
                        attempt = self.failed_attempts,
                        error = %err,
                        "board link connect failed"
                    );
                }
            }
        }
    }

    /// A dropped link counts as a failed attempt until the board proves the
    /// next one by sending a frame.
    fn drop_link(&mut self, reason: &LinkError) {
        if self.link.take().is_some() {
            self.failed_attempts += 1;
            warn!(
                link = %self.connector.describe(),
                attempt = self.failed_attempts,
                error = %reason,
                "board link dropped"
            );
        }
        self.decoder.reset();
    }

    fn pump(&mut self, ctx: &WorkerContext) -> Result<(), LinkError> {
        let link = self.link.as_mut().ok_or(LinkError::Closed)?;

        let mut buf = [0u8; READ_CHUNK];
        match link.read(&mut buf) {
            Ok(0) => return Err(LinkError::Closed),
            Ok(n) => self.decoder.feed(&buf[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err.into()),
        }

        let echoes = self.apply_frames()?;
        for correlation in echoes {
            self.write_frame(&encode(&Message::heartbeat(correlation)))?;
        }
        self.drain_commands(ctx)
    }

    fn apply_frames(&mut self) -> Result<Vec<u32>, LinkError> {
        let mut inbox = BoardInbox {
            cache: &self.cache,
            config: &self.config,
            echoes: Vec::new(),
        };

        let mut decoded = 0usize;
        while let Some(message) = self.decoder.next_message()? {
            decoded += 1;
            if let Err(err) = dispatch(&mut inbox, &message) {
                warn!(error = %err, "ignoring board frame");
            }
        }
        if decoded > 0 && self.failed_attempts > 0 {
            debug!(after = self.failed_attempts, "board link healthy again");
            self.failed_attempts = 0;
        }
        Ok(inbox.echoes)
    }

    fn drain_commands(&mut self, ctx: &WorkerContext) -> Result<(), LinkError> {
        let spacing = self.settings.min_command_spacing();

        while let Some(command) = self.queue.pop() {
            if let Some(last) = self.last_command_at {
                let since = last.elapsed();
                if since < spacing && !ctx.sleep(spacing - since) {
                    self.queue.requeue_front(command);
                    return Ok(());
                }
            }

            let Some(frame) = self.encode_command(&command) else {
                continue;
            };
            if let Err(err) = self.write_frame(&frame) {
                self.queue.requeue_front(command);
                return Err(err);
            }
            self.last_command_at = Some(Instant::now());
            debug!(point_id = %command.point_id, value = command.value, "command sent");
        }
        Ok(())
    }

    fn encode_command(&mut self, command: &BoardCommand) -> Option<Vec<u8>> {
        let Some(point) = self.config.point(&command.point_id) else {
            warn!(point_id = %command.point_id, "dropping command for unconfigured point");
            return None;
        };
        if point.direction != Direction::Output {
            warn!(point_id = %command.point_id, "dropping command for an input point");
            return None;
        }

        let raw = BoardCommand::new(&command.point_id, point.scaling.to_raw(command.value));
        match Message::json(MessageType::BoardCommand, self.correlations.issue(), &raw) {
            Ok(message) => Some(encode(&message)),
            Err(err) => {
                warn!(point_id = %command.point_id, error = %err, "dropping unencodable command");
                None
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let link = self.link.as_mut().ok_or(LinkError::Closed)?;
        link.write_all(frame)?;
        link.flush()?;
        Ok(())
    }
}

impl Worker for SerialIoWorker {
    fn run_iteration(&mut self, ctx: &WorkerContext) -> Result<Step, WorkerError> {
        if self.link.is_none() && !self.reconnect(ctx)? {
            return Ok(Step::Continue);
        }

        if let Err(err) = self.pump(ctx) {
            self.drop_link(&err);
        }
        Ok(Step::Continue)
    }

    fn on_stop(&mut self, _ctx: &WorkerContext) {
        if self.link.take().is_some() {
            info!(link = %self.connector.describe(), "board link closed");
        }
    }
}
