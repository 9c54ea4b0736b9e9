//! Where and how an application worker listens.
//!
//! ## Rules
//! - Sticky mode: bind loopback on an ephemeral port; real clients arrive as
//!   handed-off connections.
//! - A unit-configured unix path wins over any port. A stale socket file (nobody
//!   accepting behind it) is removed before binding; a live one is an error.
//! - Otherwise `options.port`, falling back to the unit's port when it is `0`.
//!   With neither, the kernel picks a port; the runtime warns about it.
//!   TCP listeners set `SO_REUSEADDR` and `SO_REUSEPORT` so every worker of the
//!   pool can bind the same port.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, warn};

use super::Connection;
use crate::options::StartupOptions;
use crate::unit::ListenConfig;

const BACKLOG: i32 = 1024;
const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenTarget {
    Sticky,
    Tcp { host: Option<String>, port: u16 },
    Unix(PathBuf),
}

impl ListenTarget {
    pub fn resolve(options: &StartupOptions, unit: &ListenConfig) -> Self {
        if options.sticky {
            return ListenTarget::Sticky;
        }
        if let Some(path) = &unit.path {
            return ListenTarget::Unix(path.clone());
        }
        let port = match options.port {
            0 => unit.port.unwrap_or(0),
            p => p,
        };
        ListenTarget::Tcp {
            host: unit.hostname.clone(),
            port,
        }
    }

    /// TCP on port `0`: neither the options nor the unit named a port.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ListenTarget::Tcp { port: 0, .. })
    }
}

/// A bound server socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(target: &ListenTarget) -> io::Result<Self> {
        match target {
            ListenTarget::Sticky => Ok(Listener::Tcp(TcpListener::bind("127.0.0.1:0").await?)),
            ListenTarget::Tcp { host, port } => {
                let host = host.as_deref().unwrap_or(DEFAULT_HOST);
                let addr = tokio::net::lookup_host((host, *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{host} did not resolve"))
                    })?;
                Ok(Listener::Tcp(bind_shared(addr)?))
            }
            ListenTarget::Unix(path) => Ok(Listener::Unix {
                listener: bind_unix(path)?,
                path: path.clone(),
            }),
        }
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(l) => l.accept().await.map(|(s, _)| Connection::Tcp(s)),
            Listener::Unix { listener, .. } => {
                listener.accept().await.map(|(s, _)| Connection::Unix(s))
            }
        }
    }

    /// Bound TCP port; `0` for a unix socket.
    pub fn port(&self) -> u16 {
        match self {
            Listener::Tcp(l) => l.local_addr().map_or(0, |a| a.port()),
            Listener::Unix { .. } => 0,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_shared(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            match std::os::unix::net::UnixStream::connect(path) {
                Err(probe) if probe.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!(path = %path.display(), "removing stale socket file");
                    std::fs::remove_file(path)?;
                    UnixListener::bind(path)
                }
                _ => {
                    debug!(path = %path.display(), "socket path is served by someone else");
                    Err(e)
                }
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(port: u16, sticky: bool) -> StartupOptions {
        StartupOptions {
            framework: "echo".into(),
            base_dir: PathBuf::from("."),
            port,
            workers: 1,
            https: false,
            key: None,
            cert: None,
            sticky,
        }
    }

    #[test]
    fn path_wins_over_port_and_sticky_wins_over_all() {
        let unit = ListenConfig {
            port: Some(9000),
            path: Some(PathBuf::from("/tmp/app.sock")),
            hostname: None,
        };
        assert_eq!(
            ListenTarget::resolve(&options(7001, false), &unit),
            ListenTarget::Unix(PathBuf::from("/tmp/app.sock"))
        );
        assert_eq!(
            ListenTarget::resolve(&options(7001, true), &unit),
            ListenTarget::Sticky
        );
    }

    #[test]
    fn unit_port_applies_only_when_options_port_is_zero() {
        let unit = ListenConfig {
            port: Some(9000),
            ..Default::default()
        };
        assert_eq!(
            ListenTarget::resolve(&options(0, false), &unit),
            ListenTarget::Tcp { host: None, port: 9000 }
        );
        assert_eq!(
            ListenTarget::resolve(&options(7001, false), &unit),
            ListenTarget::Tcp { host: None, port: 7001 }
        );
    }

    #[test]
    fn missing_port_is_flagged_as_ephemeral() {
        let target = ListenTarget::resolve(&options(0, false), &ListenConfig::default());
        assert_eq!(target, ListenTarget::Tcp { host: None, port: 0 });
        assert!(target.is_ephemeral());

        let unit = ListenConfig {
            port: Some(9000),
            ..Default::default()
        };
        assert!(!ListenTarget::resolve(&options(0, false), &unit).is_ephemeral());
        assert!(!ListenTarget::resolve(&options(0, true), &unit).is_ephemeral());
    }

    #[tokio::test]
    async fn two_listeners_share_one_port() {
        let first = Listener::bind(&ListenTarget::Tcp {
            host: Some("127.0.0.1".into()),
            port: 0,
        })
        .await
        .unwrap();
        let port = first.port();
        assert_ne!(port, 0);

        let second = Listener::bind(&ListenTarget::Tcp {
            host: Some("127.0.0.1".into()),
            port,
        })
        .await
        .unwrap();
        assert_eq!(second.port(), port);
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");
        {
            let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
            drop(std_listener);
        }
        assert!(path.exists());

        let listener = Listener::bind(&ListenTarget::Unix(path.clone())).await.unwrap();
        assert_eq!(listener.port(), 0);

        let err = Listener::bind(&ListenTarget::Unix(path.clone())).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(listener);
        assert!(!path.exists());
    }
}
