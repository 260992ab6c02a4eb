//! Async client for the daemon's socket protocol.
//!
//! ```no_run
//! # async fn demo() -> Result<(), hvacd::client::ClientError> {
//! use hvacd::client::HvacClient;
//! use hvacd::payload::{Query, Reply};
//!
//! let mut client = HvacClient::connect("tcp://127.0.0.1:5050").await?;
//! client.hello().await?;
//! if let Reply::Snapshot(snapshot) = client.query(Query::ReadAll).await? {
//!     println!("{} points at version {}", snapshot.len(), snapshot.version);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::config::ConfigError;
use crate::payload::{ErrorPayload, Query, Reply, SubscribeRequest, TelemetryPayload};
use crate::protocol::{
    encode, CorrelationIds, FrameDecoder, Message, MessageType, ProtocolError, PROTOCOL_VERSION,
};
use crate::threads::listener::ListenAddress;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Address(#[from] ConfigError),
    #[error("daemon closed the connection")]
    Closed,
    #[error("daemon reported {0}")]
    Remote(ErrorPayload),
    #[error("request failed: {0}")]
    Failed(String),
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(Box<Reply>),
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct HvacClient {
    reader: Reader,
    writer: Writer,
    decoder: FrameDecoder,
    correlations: CorrelationIds,
    telemetry: VecDeque<TelemetryPayload>,
    protocol_version: u16,
}

impl HvacClient {
    /// Connects to `tcp://host:port` or `unix:///path`.
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let (reader, writer): (Reader, Writer) = match ListenAddress::parse(address)? {
            ListenAddress::Tcp(host) => {
                let stream = TcpStream::connect(host.as_str()).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(_) => {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
        };

        Ok(Self {
            reader,
            writer,
            decoder: FrameDecoder::default(),
            correlations: CorrelationIds::new(),
            telemetry: VecDeque::new(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Negotiates the protocol version.
    pub async fn hello(&mut self) -> Result<u16, ClientError> {
        match self.query(Query::Hello { version: PROTOCOL_VERSION }).await? {
            Reply::Hello { version } => {
                self.protocol_version = version;
                Ok(version)
            }
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    /// Sends a query and waits for the response carrying its correlation id.
    /// Telemetry arriving meanwhile is kept for [`next_telemetry`](Self::next_telemetry).
    pub async fn query(&mut self, query: Query) -> Result<Reply, ClientError> {
        let correlation = self.correlations.allocate();
        self.send(&Message::json(MessageType::ClientQuery, correlation, &query)?)
            .await?;
        self.await_reply(correlation).await
    }

    /// Subscribes to telemetry for `point_ids` (all points when empty).
    pub async fn subscribe(&mut self, point_ids: Vec<String>) -> Result<(), ClientError> {
        let correlation = self.correlations.allocate();
        let request = SubscribeRequest { point_ids };
        self.send(&Message::json(MessageType::ClientSubscribe, correlation, &request)?)
            .await?;
        match self.await_reply(correlation).await? {
            Reply::Ack => Ok(()),
            Reply::Failed { reason } => Err(ClientError::Failed(reason)),
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    pub async fn next_telemetry(&mut self) -> Result<TelemetryPayload, ClientError> {
        loop {
            if let Some(telemetry) = self.telemetry.pop_front() {
                return Ok(telemetry);
            }
            let message = self.recv().await?;
            self.absorb(message).await?;
        }
    }

    /// Writes one raw message.
    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        self.writer.write_all(&encode(message)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes raw bytes, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next frame from the daemon, whatever its kind.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(message);
            }
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                self.decoder.finish()?;
                return Err(ClientError::Closed);
            }
            self.decoder.feed(&buf[..n]);
        }
    }

    async fn await_reply(&mut self, correlation: u32) -> Result<Reply, ClientError> {
        loop {
            let message = self.recv().await?;
            if message.message_type == MessageType::ClientResponse
                && message.correlation == correlation
            {
                self.correlations.complete(correlation);
                return Ok(message.parse_json()?);
            }
            self.absorb(message).await?;
        }
    }

    /// Handles a message that is not the awaited response.
    async fn absorb(&mut self, message: Message) -> Result<(), ClientError> {
        match message.message_type {
            MessageType::BoardTelemetry => {
                self.telemetry.push_back(message.parse_json()?);
                Ok(())
            }
            MessageType::Heartbeat => self.send(&Message::heartbeat(message.correlation)).await,
            MessageType::ClientResponse => {
                self.correlations.complete(message.correlation);
                Ok(())
            }
            MessageType::Error => Err(ClientError::Remote(message.parse_json()?)),
            other => Err(ProtocolError::UnexpectedType(other).into()),
        }
    }
}
