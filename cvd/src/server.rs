//! The daemon's socket front end.
//!
//! One listener, backlog 1, one connection served at a time; each
//! request is dispatched synchronously against the registry. Local
//! sockets support the abstract namespace via a leading `@` in the
//! configured address; filesystem paths are unlinked before bind.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use containerv::backend::ContainerBackend;
use containerv_proto::Request;

use crate::config::{AddressKind, ApiAddress};
use crate::registry::Registry;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

/// Bound RPC listener.
#[derive(Debug)]
pub enum Listener {
    /// `AF_UNIX` socket.
    #[cfg(unix)]
    Local(UnixListener),
    /// `AF_INET` loopback socket.
    Inet(TcpListener),
}

/// One accepted client connection.
#[derive(Debug)]
pub enum Conn {
    /// Stream over a local socket.
    #[cfg(unix)]
    Local(UnixStream),
    /// Stream over TCP.
    Inet(TcpStream),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Local(s) => s.read(buf),
            Self::Inet(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
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

/// Binds the configured API address.
pub fn bind(addr: &ApiAddress) -> io::Result<Listener> {
    match addr.kind {
        AddressKind::Local => bind_local(&addr.address),
        AddressKind::Inet4 => {
            let listener = TcpListener::bind((addr.address.as_str(), addr.port))?;
            info!(address = %addr.address, port = addr.port, "listening on tcp");
            Ok(Listener::Inet(listener))
        }
    }
}

#[cfg(unix)]
fn bind_local(address: &str) -> io::Result<Listener> {
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::sys::socket::{
        AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind as sock_bind, listen, socket,
    };

    let addr = if let Some(name) = address.strip_prefix('@') {
        // Abstract namespace: the leading byte of sun_path is NUL and
        // the name is not subject to filesystem permissions.
        UnixAddr::new_abstract(name.as_bytes())?
    } else {
        let _ = std::fs::remove_file(address);
        UnixAddr::new(address)?
    };

    let fd: OwnedFd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    sock_bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(1).map_err(io::Error::from)?)?;

    info!(address, "listening on local socket");
    Ok(Listener::Local(UnixListener::from(fd)))
}

#[cfg(not(unix))]
fn bind_local(_address: &str) -> io::Result<Listener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local sockets require unix",
    ))
}

impl Listener {
    /// Blocks until the next client connects.
    pub fn accept(&self) -> io::Result<Conn> {
        match self {
            #[cfg(unix)]
            Self::Local(l) => l.accept().map(|(s, _)| Conn::Local(s)),
            Self::Inet(l) => l.accept().map(|(s, _)| Conn::Inet(s)),
        }
    }
}

/// Accept loop: serves clients until the shutdown flag is raised.
///
/// The flag is observed between connections; a signal received while a
/// session is active takes effect after that client hangs up.
pub fn serve<B: ContainerBackend>(
    listener: &Listener,
    registry: &mut Registry<B>,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        let conn = match listener.accept() {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if let Err(e) = session(conn, registry) {
            warn!(error = %e, "session ended with error");
        }
    }
    info!("shutdown requested");
    Ok(())
}

/// Serves one connection: request in, response out, until EOF.
pub fn session<B: ContainerBackend>(
    mut conn: impl Read + Write,
    registry: &mut Registry<B>,
) -> io::Result<()> {
    loop {
        let request: Request = match containerv_proto::read_packet(&mut conn) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        debug!(?request, "dispatch");
        let response = registry.handle(request);
        containerv_proto::write_packet(&mut conn, &response)?;
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn abstract_address_binds_and_accepts() {
        use nix::sys::socket::{
            AddressFamily, SockFlag, SockType, UnixAddr, connect, socket,
        };
        use std::os::fd::AsRawFd;

        let name = format!("@/chef/cvd/test-{}", std::process::id());
        let listener = bind(&ApiAddress {
            kind: AddressKind::Local,
            address: name.clone(),
            port: 0,
        })
        .unwrap();

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        let addr = UnixAddr::new_abstract(name.trim_start_matches('@').as_bytes()).unwrap();
        connect(fd.as_raw_fd(), &addr).unwrap();
        listener.accept().unwrap();
    }

    #[test]
    fn path_address_is_unlinked_before_bind() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        std::fs::write(&path, b"stale").unwrap();

        let addr = ApiAddress {
            kind: AddressKind::Local,
            address: path.to_string_lossy().into_owned(),
            port: 0,
        };
        let _listener = bind(&addr).unwrap();
        // The stale regular file is gone; the socket inode took its place.
        assert!(std::fs::metadata(&path).unwrap().file_type().is_socket());
    }
}
