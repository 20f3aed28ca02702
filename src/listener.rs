//! The sockets clients connect to

use crate::{client::Stream, error::Error};
use log::{debug, info};
use mio::{
    net::{TcpListener, UnixListener},
    Interest, Registry, Token,
};
use std::{
    fs,
    io::{self, ErrorKind},
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

pub struct Listener {
    path: PathBuf,
    unix: UnixListener,
    tcp: Option<TcpListener>,
}

impl Listener {
    /// Create the local socket with the given file mode, replacing any stale
    /// socket file, and optionally a tcp listener
    pub fn bind(path: &Path, permission: u32, listen: Option<SocketAddr>) -> Result<Self, Error> {
        if fs::symlink_metadata(path).is_ok() {
            debug!("{}: removing stale socket", path.display());
            fs::remove_file(path).map_err(|e| Error::io(path.display().to_string(), e))?;
        }

        let unix = UnixListener::bind(path)
            .map_err(|e| Error::io(format!("could not bind {}", path.display()), e))?;

        fs::set_permissions(path, fs::Permissions::from_mode(permission)).map_err(|e| {
            Error::io(
                format!("could not set file permissions on {}", path.display()),
                e,
            )
        })?;

        let tcp = match listen {
            Some(addr) => {
                let tcp = TcpListener::bind(addr)
                    .map_err(|e| Error::io(format!("could not bind {addr}"), e))?;

                info!("listening on {}", tcp.local_addr().unwrap_or(addr));

                Some(tcp)
            }
            None => None,
        };

        Ok(Listener {
            path: path.to_path_buf(),
            unix,
            tcp,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Actual address of the tcp listener, useful when bound to port 0
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|t| t.local_addr().ok())
    }

    pub fn register(&mut self, registry: &Registry, unix: Token, tcp: Token) -> io::Result<()> {
        registry.register(&mut self.unix, unix, Interest::READABLE)?;

        if let Some(listener) = &mut self.tcp {
            registry.register(listener, tcp, Interest::READABLE)?;
        }

        Ok(())
    }

    /// Accept one pending connection on the local socket
    pub fn accept_unix(&self) -> io::Result<Option<Stream>> {
        match self.unix.accept() {
            Ok((stream, _)) => Ok(Some(Stream::Unix(stream))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Accept one pending connection on the tcp socket
    pub fn accept_tcp(&self) -> io::Result<Option<Stream>> {
        let Some(tcp) = &self.tcp else {
            return Ok(None);
        };

        match tcp.accept() {
            Ok((stream, _)) => Ok(Some(Stream::Tcp(stream))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
