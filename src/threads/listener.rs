use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::connection::{ClientServices, ConnectionWorker};
use super::worker::{self, Step, Worker, WorkerContext, WorkerError};
use crate::config::ConfigError;
use crate::settings::ListenerSettings;

pub const LISTENER_WORKER_NAME: &str = "listener";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddress {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        if let Some(host) = address.strip_prefix("tcp://") {
            if !host.is_empty() {
                return Ok(ListenAddress::Tcp(host.to_string()));
            }
        } else if let Some(path) = address.strip_prefix("unix://") {
            if !path.is_empty() {
                return Ok(ListenAddress::Unix(PathBuf::from(path)));
            }
        }
        Err(ConfigError::InvalidEndpoint(address.to_string()))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(host) => write!(f, "tcp://{host}"),
            ListenAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// An accepted (or dialled) client socket.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    pub fn connect(address: &ListenAddress) -> io::Result<Self> {
        match address {
            ListenAddress::Tcp(host) => Ok(ClientStream::Tcp(TcpStream::connect(host.as_str())?)),
            #[cfg(unix)]
            ListenAddress::Unix(path) => Ok(ClientStream::Unix(UnixStream::connect(path)?)),
            #[cfg(not(unix))]
            ListenAddress::Unix(_) => Err(io::Error::new(
                ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.flush(),
        }
    }
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl Acceptor {
    fn bind(address: &ListenAddress) -> io::Result<Self> {
        let acceptor = match address {
            ListenAddress::Tcp(host) => Acceptor::Tcp(TcpListener::bind(host.as_str())?),
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Acceptor::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                }
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(_) => {
                return Err(io::Error::new(
                    ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                ))
            }
        };

        match &acceptor {
            Acceptor::Tcp(l) => l.set_nonblocking(true)?,
            #[cfg(unix)]
            Acceptor::Unix { listener, .. } => listener.set_nonblocking(true)?,
        }
        Ok(acceptor)
    }

    /// Bound address in `scheme://` form, with the real port for `:0` binds.
    fn local_address(&self) -> io::Result<String> {
        match self {
            Acceptor::Tcp(l) => Ok(format!("tcp://{}", l.local_addr()?)),
            #[cfg(unix)]
            Acceptor::Unix { path, .. } => Ok(format!("unix://{}", path.display())),
        }
    }

    fn accept(&self) -> io::Result<Option<(ClientStream, String)>> {
        let accepted = match self {
            Acceptor::Tcp(l) => l
                .accept()
                .map(|(stream, peer)| (ClientStream::Tcp(stream), peer.to_string())),
            #[cfg(unix)]
            Acceptor::Unix { listener, path } => listener
                .accept()
                .map(|(stream, _)| (ClientStream::Unix(stream), path.display().to_string())),
        };
        match accepted {
            Ok(pair) => Ok(Some(pair)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(unix)]
impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Acceptor::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Accepts clients and hands each one to its own `client-<n>` worker.
pub struct ListenerWorker {
    acceptor: Acceptor,
    services: Arc<ClientServices>,
}

impl ListenerWorker {
    pub fn bind(services: Arc<ClientServices>) -> Result<Self, WorkerError> {
        let address = ListenAddress::parse(&services.settings.address)
            .map_err(|e| WorkerError::Failed(e.to_string()))?;
        let acceptor = Acceptor::bind(&address)?;
        let bound = acceptor.local_address()?;
        info!(address = %bound, "listening for clients");
        services.set_bound_address(bound);
        Ok(Self { acceptor, services })
    }

    fn admit(&self, ctx: &WorkerContext, stream: ClientStream, peer: String) -> io::Result<()> {
        prepare(&stream, &self.services.settings)?;

        let name = format!("client-{}", self.services.next_client_id());
        let connection = ConnectionWorker::new(stream, peer.clone(), Arc::clone(&self.services));
        match worker::spawn(ctx.registry(), &name, Box::new(connection)) {
            Ok(_) => info!(client = %name, %peer, "client connected"),
            Err(err) => warn!(client = %name, error = %err, "could not start client worker"),
        }
        Ok(())
    }
}

/// Blocking with bounded reads and writes, so a client that never drains its
/// socket cannot wedge its worker.
fn prepare(stream: &ClientStream, settings: &ListenerSettings) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(settings.read_timeout()))?;
    stream.set_write_timeout(Some(settings.write_timeout()))
}

impl Worker for ListenerWorker {
    fn run_iteration(&mut self, ctx: &WorkerContext) -> Result<Step, WorkerError> {
        loop {
            match self.acceptor.accept() {
                Ok(Some((stream, peer))) => {
                    if let Err(err) = self.admit(ctx, stream, peer) {
                        warn!(error = %err, "failed to set up client socket");
                    }
                }
                Ok(None) => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::Interrupted
                    ) =>
                {
                    warn!(error = %err, "accept interrupted");
                }
                Err(err) => return Err(err.into()),
            }
        }

        ctx.sleep(self.services.settings.accept_poll());
        Ok(Step::Continue)
    }
}
