use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use heapless::Vec as BoundedVec;
use tracing::{debug, info, warn};

use super::listener::ClientStream;
use super::logic::SharedLogicStatus;
use super::registry::ThreadRegistry;
use super::worker::{Step, Worker, WorkerContext, WorkerError};
use crate::alert::AlertLog;
use crate::cache::{BoardStateCache, CacheEntry};
use crate::config::{Configurator, Direction};
use crate::now_millis;
use crate::payload::{
    BoardCommand, ErrorPayload, HealthReport, Query, Reading, Reply, SubscribeRequest,
    TelemetryPayload,
};
use crate::protocol::{
    dispatch, encode, CorrelationIds, FrameDecoder, Message, MessageHandler, MessageType,
    ProtocolError, NO_CORRELATION, PROTOCOL_VERSION,
};
use crate::queue::CommandQueue;
use crate::settings::ListenerSettings;

const READ_CHUNK: usize = 1024;

/// Heartbeats the daemon keeps waiting on per client. Older ones are
/// forgotten when a client does not echo.
pub const MAX_PENDING_PINGS: usize = 4;

/// Everything a client connection may read or change.
pub struct ClientServices {
    pub cache: Arc<BoardStateCache>,
    pub config: Arc<Configurator>,
    pub queue: Arc<CommandQueue>,
    pub registry: Arc<ThreadRegistry>,
    pub alerts: Arc<AlertLog>,
    pub logic_status: SharedLogicStatus,
    pub settings: ListenerSettings,
    bound_address: RwLock<Option<String>>,
    next_client: AtomicU64,
}

impl ClientServices {
    pub fn new(
        cache: Arc<BoardStateCache>,
        config: Arc<Configurator>,
        queue: Arc<CommandQueue>,
        registry: Arc<ThreadRegistry>,
        alerts: Arc<AlertLog>,
        logic_status: SharedLogicStatus,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            cache,
            config,
            queue,
            registry,
            alerts,
            logic_status,
            settings,
            bound_address: RwLock::new(None),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn bound_address(&self) -> Option<String> {
        self.bound_address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_bound_address(&self, address: String) {
        *self
            .bound_address
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(address);
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    All,
    Points(BTreeSet<String>),
}

impl Subscription {
    pub fn includes(&self, point_id: &str) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Points(ids) => ids.contains(point_id),
        }
    }
}

/// Per-client session state.
#[derive(Debug)]
pub struct Connection {
    pub peer: String,
    pub protocol_version: u16,
    pub subscription: Option<Subscription>,
    pub last_forwarded: u64,
    pub last_received: Instant,
    pub last_ping: Instant,
}

pub struct ConnectionWorker {
    stream: ClientStream,
    decoder: FrameDecoder,
    session: Connection,
    services: Arc<ClientServices>,
    pings: CorrelationIds,
    pending_pings: BoundedVec<u32, MAX_PENDING_PINGS>,
    outbox: Vec<Message>,
}

impl ConnectionWorker {
    pub fn new(stream: ClientStream, peer: String, services: Arc<ClientServices>) -> Self {
        let now = Instant::now();
        Self {
            stream,
            decoder: FrameDecoder::new(services.settings.max_frame_size),
            session: Connection {
                peer,
                protocol_version: PROTOCOL_VERSION,
                subscription: None,
                last_forwarded: 0,
                last_received: now,
                last_ping: now,
            },
            services,
            pings: CorrelationIds::new(),
            pending_pings: BoundedVec::new(),
            outbox: Vec::new(),
        }
    }

    fn respond(&mut self, correlation: u32, reply: &Reply) -> Result<(), ProtocolError> {
        let message = Message::json(MessageType::ClientResponse, correlation, reply)?;
        self.outbox.push(message);
        Ok(())
    }

    fn answer(&mut self, query: Query) -> Reply {
        let services = &self.services;
        match query {
            Query::Hello { version } => {
                if version == 0 {
                    return Reply::failed("protocol version 0 is not supported");
                }
                self.session.protocol_version = version.min(PROTOCOL_VERSION);
                Reply::Hello {
                    version: self.session.protocol_version,
                }
            }
            Query::Ping => Reply::Pong,
            Query::ReadPoint { point_id } => match services.cache.read(&point_id) {
                Some(entry) => Reply::Point(entry),
                None if services.cache.is_known(&point_id) => {
                    Reply::failed(format!("no reading for '{point_id}' yet"))
                }
                None => Reply::failed(format!("unknown board point '{point_id}'")),
            },
            Query::ReadRaw { point_id } => match services.cache.read(&point_id) {
                Some(CacheEntry {
                    raw: Some(raw), ..
                }) => Reply::Raw { point_id, raw },
                Some(_) => Reply::failed(format!("no board reading for '{point_id}' yet")),
                None if services.cache.is_known(&point_id) => {
                    Reply::failed(format!("no reading for '{point_id}' yet"))
                }
                None => Reply::failed(format!("unknown board point '{point_id}'")),
            },
            Query::ReadAll => Reply::Snapshot(services.cache.read_all()),
            Query::ListPoints => Reply::Points(services.config.points().cloned().collect()),
            Query::ListSetPoints => Reply::SetPoints(services.config.set_points()),
            Query::GetSetPoint { name } => match services.config.set_point(&name) {
                Some(set_point) => Reply::SetPoint(set_point),
                None => Reply::failed(format!("unknown set point '{name}'")),
            },
            Query::SetSetPoint { name, target } => {
                match services.config.update_target(&name, target) {
                    Ok(set_point) => Reply::SetPoint(set_point),
                    Err(err) => Reply::failed(err.to_string()),
                }
            }
            Query::ForcePoint { point_id, value } => match services.cache.force(&point_id, value) {
                Ok(_) => Reply::Ack,
                Err(err) => Reply::failed(err.to_string()),
            },
            Query::UnforcePoint { point_id } => match services.cache.unforce(&point_id) {
                Ok(_) => Reply::Ack,
                Err(err) => Reply::failed(err.to_string()),
            },
            Query::WriteOutput { point_id, value } => match services.config.point(&point_id) {
                Some(point) if point.direction == Direction::Output => {
                    info!(peer = %self.session.peer, %point_id, value, "manual output write");
                    services.queue.push(BoardCommand::new(point_id, value));
                    Reply::Ack
                }
                Some(_) => Reply::failed(format!("'{point_id}' is not an output point")),
                None => Reply::failed(format!("unknown board point '{point_id}'")),
            },
            Query::LogicStatus => Reply::LogicStatus(
                services
                    .logic_status
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
            Query::Threads => {
                let now = Instant::now();
                Reply::Threads(
                    services
                        .registry
                        .snapshot()
                        .iter()
                        .map(|r| r.status(now))
                        .collect(),
                )
            }
            Query::Health => Reply::Health(HealthReport {
                healthy: services.alerts.is_healthy(),
                alerts: services.alerts.records(),
            }),
        }
    }

    fn forward_telemetry(&mut self) -> Result<(), ProtocolError> {
        let Some(subscription) = &self.session.subscription else {
            return Ok(());
        };
        let changed = self
            .services
            .cache
            .changed_since(self.session.last_forwarded, |id| subscription.includes(id));
        let Some(newest) = changed.last().map(|e| e.version) else {
            return Ok(());
        };

        let payload = TelemetryPayload {
            timestamp_ms: now_millis(),
            readings: changed.iter().map(Reading::from).collect(),
        };
        self.outbox.push(Message::json(
            MessageType::BoardTelemetry,
            NO_CORRELATION,
            &payload,
        )?);
        self.session.last_forwarded = newest;
        Ok(())
    }

    fn send_ping(&mut self) {
        if self.pending_pings.is_full() {
            let oldest = self.pending_pings.remove(0);
            self.pings.complete(oldest);
        }
        let correlation = self.pings.allocate();
        let _ = self.pending_pings.push(correlation);
        self.outbox.push(Message::heartbeat(correlation));
    }

    fn flush_outbox(&mut self) -> std::io::Result<()> {
        for message in self.outbox.drain(..) {
            self.stream.write_all(&encode(&message))?;
        }
        self.stream.flush()
    }

    fn reject(&mut self, err: &ProtocolError) {
        warn!(peer = %self.session.peer, error = %err, "protocol violation, closing connection");
        self.outbox.clear();
        if let Ok(message) = Message::json(MessageType::Error, NO_CORRELATION, &ErrorPayload::from(err)) {
            self.outbox.push(message);
        }
        let _ = self.flush_outbox();
    }
}

impl MessageHandler for ConnectionWorker {
    fn on_client_query(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let query: Query = message.parse_json()?;
        debug!(peer = %self.session.peer, ?query, "client query");
        let reply = self.answer(query);
        self.respond(message.correlation, &reply)
    }

    fn on_client_subscribe(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let request: SubscribeRequest = message.parse_json()?;

        if let Some(unknown) = request
            .point_ids
            .iter()
            .find(|id| !self.services.cache.is_known(id))
        {
            let reply = Reply::failed(format!("unknown board point '{unknown}'"));
            return self.respond(message.correlation, &reply);
        }

        self.session.subscription = Some(if request.point_ids.is_empty() {
            Subscription::All
        } else {
            Subscription::Points(request.point_ids.into_iter().collect())
        });
        self.session.last_forwarded = 0;
        info!(peer = %self.session.peer, "client subscribed to telemetry");
        self.respond(message.correlation, &Reply::Ack)
    }

    fn on_heartbeat(&mut self, message: &Message) -> Result<(), ProtocolError> {
        if self.pings.complete(message.correlation) {
            self.pending_pings.retain(|id| *id != message.correlation);
        } else {
            self.outbox.push(Message::heartbeat(message.correlation));
        }
        Ok(())
    }

    fn on_error(&mut self, message: &Message) -> Result<(), ProtocolError> {
        match message.parse_json::<ErrorPayload>() {
            Ok(report) => warn!(peer = %self.session.peer, %report, "client reported an error"),
            Err(_) => warn!(peer = %self.session.peer, "client reported an unreadable error"),
        }
        Ok(())
    }
}

impl Worker for ConnectionWorker {
    fn run_iteration(&mut self, _ctx: &WorkerContext) -> Result<Step, WorkerError> {
        let mut buf = [0u8; READ_CHUNK];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                if let Err(err) = self.decoder.finish() {
                    debug!(peer = %self.session.peer, error = %err, "client closed mid-frame");
                }
                info!(peer = %self.session.peer, "client disconnected");
                return Ok(Step::Finished);
            }
            Ok(n) => {
                self.session.last_received = Instant::now();
                self.decoder.feed(&buf[..n]);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!(peer = %self.session.peer, error = %err, "client read failed");
                return Ok(Step::Finished);
            }
        }

        loop {
            let message = match self.decoder.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    self.reject(&err);
                    return Ok(Step::Finished);
                }
            };
            if let Err(err) = dispatch(self, &message) {
                self.reject(&err);
                return Ok(Step::Finished);
            }
        }

        if let Err(err) = self.forward_telemetry() {
            warn!(peer = %self.session.peer, error = %err, "could not encode telemetry");
        }

        let now = Instant::now();
        let settings = &self.services.settings;
        if now.duration_since(self.session.last_received) > settings.client_timeout() {
            warn!(peer = %self.session.peer, "client unresponsive, closing connection");
            return Ok(Step::Finished);
        }
        if now.duration_since(self.session.last_ping) >= settings.client_heartbeat() {
            self.send_ping();
            self.session.last_ping = now;
        }

        if let Err(err) = self.flush_outbox() {
            warn!(peer = %self.session.peer, error = %err, "client write failed");
            return Ok(Step::Finished);
        }
        Ok(Step::Continue)
    }

    fn on_stop(&mut self, _ctx: &WorkerContext) {
        let _ = self.stream.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configurator;
    use crate::threads::logic::LogicStatus;
    use std::net::{TcpListener, TcpStream};

    fn worker() -> (ConnectionWorker, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let config = Arc::new(Configurator::new(Vec::new(), Vec::new()).unwrap());
        let services = Arc::new(ClientServices::new(
            Arc::new(BoardStateCache::from_config(&config)),
            config,
            Arc::new(CommandQueue::new()),
            Arc::new(ThreadRegistry::new()),
            Arc::new(AlertLog::new()),
            Arc::new(RwLock::new(LogicStatus::default())),
            ListenerSettings::default(),
        ));
        let worker = ConnectionWorker::new(ClientStream::Tcp(stream), "test".into(), services);
        (worker, peer)
    }

    #[test]
    fn test_unanswered_pings_are_bounded() {
        let (mut worker, _peer) = worker();
        for _ in 0..50 {
            worker.send_ping();
        }
        assert_eq!(worker.pending_pings.len(), MAX_PENDING_PINGS);
        assert_eq!(worker.pings.in_flight(), MAX_PENDING_PINGS);

        // An echo of the newest ping is consumed, not bounced back
        let newest = *worker.pending_pings.last().unwrap();
        worker.outbox.clear();
        worker.on_heartbeat(&Message::heartbeat(newest)).unwrap();
        assert!(worker.outbox.is_empty());
        assert_eq!(worker.pings.in_flight(), MAX_PENDING_PINGS - 1);
    }
}
