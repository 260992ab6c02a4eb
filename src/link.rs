//! Byte-stream transports to the I/O board.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("board link I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("board link closed by peer")]
    Closed,
    #[error("board link protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no board link after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

/// An open, bidirectional connection to the board.
pub trait BoardLink: Read + Write + Send {}

impl<T: Read + Write + Send> BoardLink for T {}

/// Opens board links. Reads and writes on returned links must time out so
/// the serial worker keeps heartbeating.
pub trait LinkConnector: Send + Sync {
    fn connect(&self) -> io::Result<Box<dyn BoardLink>>;

    fn describe(&self) -> String;
}

/// Board reachable over TCP (ser2net, a terminal server or `board-sim`).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            read_timeout,
            write_timeout,
        }
    }

    fn open(&self) -> io::Result<TcpStream> {
        let target = self.address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve", self.address),
            )
        })?;
        let stream = TcpStream::connect_timeout(&target, self.read_timeout.max(Duration::from_secs(1)))?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl LinkConnector for TcpConnector {
    fn connect(&self) -> io::Result<Box<dyn BoardLink>> {
        Ok(Box::new(self.open()?))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialConnector;

#[cfg(feature = "serial")]
mod serial {
    use std::io;
    use std::time::Duration;

    use serialport::{DataBits, Parity, StopBits};

    use super::{BoardLink, LinkConnector};

    #[derive(Debug, Clone)]
    pub struct SerialConnector {
        path: String,
        baud: u32,
        read_timeout: Duration,
    }

    impl SerialConnector {
        pub fn new(path: impl Into<String>, baud: u32, read_timeout: Duration) -> Self {
            Self {
                path: path.into(),
                baud,
                read_timeout,
            }
        }
    }

    impl LinkConnector for SerialConnector {
        fn connect(&self) -> io::Result<Box<dyn BoardLink>> {
            let port = serialport::new(&self.path, self.baud)
                .timeout(self.read_timeout)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(Parity::None)
                .open()?;
            Ok(Box::new(port))
        }

        fn describe(&self) -> String {
            format!("serial://{}@{}", self.path, self.baud)
        }
    }
}

pub const DEFAULT_BAUD: u32 = 115_200;

/// Builds a connector from an endpoint string.
///
/// `tcp://host:port` is always available; `serial:///dev/ttyS1?baud=9600`
/// needs the `serial` feature. A serial port has a single timeout shared by
/// reads and writes, so it gets the longer of the two.
pub fn connector_for(
    endpoint: &str,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Box<dyn LinkConnector>, ConfigError> {
    if let Some(address) = endpoint.strip_prefix("tcp://") {
        if address.is_empty() {
            return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
        }
        return Ok(Box::new(TcpConnector::new(address, read_timeout, write_timeout)));
    }

    if let Some(rest) = endpoint.strip_prefix("serial://") {
        let (path, baud) = parse_serial(rest)
            .ok_or_else(|| ConfigError::InvalidEndpoint(endpoint.to_string()))?;
        return serial_connector(path, baud, read_timeout.max(write_timeout), endpoint);
    }

    Err(ConfigError::InvalidEndpoint(endpoint.to_string()))
}

fn parse_serial(rest: &str) -> Option<(&str, u32)> {
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    if path.is_empty() {
        return None;
    }
    let baud = match query {
        Some(query) => query.strip_prefix("baud=")?.parse().ok()?,
        None => DEFAULT_BAUD,
    };
    Some((path, baud))
}

#[cfg(feature = "serial")]
fn serial_connector(
    path: &str,
    baud: u32,
    read_timeout: Duration,
    _endpoint: &str,
) -> Result<Box<dyn LinkConnector>, ConfigError> {
    Ok(Box::new(SerialConnector::new(path, baud, read_timeout)))
}

#[cfg(not(feature = "serial"))]
fn serial_connector(
    _path: &str,
    _baud: u32,
    _read_timeout: Duration,
    endpoint: &str,
) -> Result<Box<dyn LinkConnector>, ConfigError> {
    Err(ConfigError::InvalidEndpoint(format!(
        "{endpoint} (built without the `serial` feature)"
    )))
}
