//! Synchronous client for the cvd API socket.
//!
//! Thin typed wrappers over the packet codec; each call sends one
//! request and blocks for its response. A status other than `Success`
//! is surfaced as an error rather than a field the caller can forget
//! to check.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use containerv_proto::{
    CreateReq, Direction, Request, Response, SpawnFlags, SpawnReq, Status, TransferReq,
};

use crate::config::{AddressKind, ApiAddress};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Transport under a client connection.
#[derive(Debug)]
enum Stream {
    /// Local socket.
    #[cfg(unix)]
    Local(UnixStream),
    /// TCP loopback.
    Inet(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Local(s) => s.read(buf),
            Self::Inet(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Local(s) => s.write(buf),
            Self::Inet(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Local(s) => s.flush(),
            Self::Inet(s) => s.flush(),
        }
    }
}

/// Result of a successful spawn.
#[derive(Debug, Clone, Copy)]
pub struct Spawned {
    /// Public process id inside the container.
    pub process_id: u32,
    /// Exit code when the spawn waited for completion.
    pub exit_code: Option<i32>,
}

/// A connection to a running daemon.
#[derive(Debug)]
pub struct Client {
    /// Underlying stream.
    stream: Stream,
}

impl Client {
    /// Connects to the daemon at the configured API address.
    pub fn connect(addr: &ApiAddress) -> io::Result<Self> {
        let stream = match addr.kind {
            AddressKind::Local => connect_local(&addr.address)?,
            AddressKind::Inet4 => Stream::Inet(TcpStream::connect((
                addr.address.as_str(),
                addr.port,
            ))?),
        };
        Ok(Self { stream })
    }

    /// Creates a container; returns its id.
    pub fn create(&mut self, req: CreateReq) -> io::Result<String> {
        match self.roundtrip(&Request::Create(req))? {
            Response::Create { id, status } => checked(status, id),
            other => unexpected(&other),
        }
    }

    /// Spawns a process inside a container.
    pub fn spawn(
        &mut self,
        container_id: &str,
        command: &str,
        environment: Vec<String>,
        wait: bool,
    ) -> io::Result<Spawned> {
        let req = Request::Spawn(SpawnReq {
            container_id: container_id.to_owned(),
            command: command.to_owned(),
            environment,
            options: SpawnFlags { wait },
        });
        match self.roundtrip(&req)? {
            Response::Spawn {
                process_id,
                exit_code,
                status,
            } => checked(status, Spawned {
                process_id,
                exit_code,
            }),
            other => unexpected(&other),
        }
    }

    /// Kills a spawned process.
    pub fn kill(&mut self, container_id: &str, process_id: u32) -> io::Result<()> {
        let req = Request::Kill {
            container_id: container_id.to_owned(),
            process_id,
        };
        match self.roundtrip(&req)? {
            Response::Kill { status } => checked(status, ()),
            other => unexpected(&other),
        }
    }

    /// Copies files between host and container, pairwise.
    pub fn transfer(
        &mut self,
        container_id: &str,
        sources: Vec<String>,
        destinations: Vec<String>,
        direction: Direction,
    ) -> io::Result<()> {
        let req = Request::Transfer(TransferReq {
            container_id: container_id.to_owned(),
            source_path: sources,
            destination_path: destinations,
            direction,
        });
        match self.roundtrip(&req)? {
            Response::Transfer { status } => checked(status, ()),
            other => unexpected(&other),
        }
    }

    /// Tears down a container.
    pub fn destroy(&mut self, container_id: &str) -> io::Result<()> {
        let req = Request::Destroy {
            container_id: container_id.to_owned(),
        };
        match self.roundtrip(&req)? {
            Response::Destroy { status } => checked(status, ()),
            other => unexpected(&other),
        }
    }

    /// Sends one request and reads its response.
    fn roundtrip(&mut self, req: &Request) -> io::Result<Response> {
        containerv_proto::write_packet(&mut self.stream, req)?;
        containerv_proto::read_packet(&mut self.stream)
    }
}

#[cfg(unix)]
fn connect_local(address: &str) -> io::Result<Stream> {
    if let Some(name) = address.strip_prefix('@') {
        use std::os::fd::AsRawFd;

        use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new_abstract(name.as_bytes())?;
        connect(fd.as_raw_fd(), &addr)?;
        Ok(Stream::Local(UnixStream::from(fd)))
    } else {
        Ok(Stream::Local(UnixStream::connect(address)?))
    }
}

#[cfg(not(unix))]
fn connect_local(_address: &str) -> io::Result<Stream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local sockets require unix",
    ))
}

/// Folds a non-success status into an error.
fn checked<T>(status: Status, value: T) -> io::Result<T> {
    if status.is_success() {
        Ok(value)
    } else {
        Err(io::Error::other(format!(
            "daemon returned {status} ({})",
            status.code()
        )))
    }
}

/// A response variant that does not match the request.
fn unexpected<T>(response: &Response) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected response {response:?}"),
    ))
}
