//! Endpoint addressing and the stream/listener types both transports share

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::core::{BrowseError, Result};

/// Longest socket path we bind; `sun_path` is 104 bytes on macOS, 108 on Linux
const MAX_SOCKET_PATH: usize = 104;

/// A byte stream from either transport
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Boxed stream so connections are transport-agnostic
pub type BoxStream = Box<dyn Stream>;

/// Where a session daemon (or its bridge) listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// First 8 bytes of SHA-256 over `salt` and `name`
pub fn name_hash(salt: &str, name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Loopback port for a name inside `[base, base + span)`
pub fn port_for(salt: &str, name: &str, base: u16, span: u16) -> Result<u16> {
    if span == 0 {
        return Err(BrowseError::config("daemon.port_span must be greater than zero"));
    }
    let last = base as u32 + span as u32 - 1;
    if last > u16::MAX as u32 {
        return Err(BrowseError::config(format!(
            "port range {}+{} runs past 65535",
            base, span
        )));
    }
    let offset = name_hash(salt, name) % span as u64;
    Ok(base + offset as u16)
}

/// Socket file for a name, falling back to a hashed file name when the
/// readable one would exceed the platform limit
#[cfg(unix)]
pub fn socket_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    let readable = dir.join(format!("{}{}.sock", name, suffix));
    if readable.as_os_str().len() < MAX_SOCKET_PATH {
        return readable;
    }
    let short = format!("{:016x}.sock", name_hash(suffix, name));
    let hashed = dir.join(&short);
    if hashed.as_os_str().len() < MAX_SOCKET_PATH {
        hashed
    } else {
        std::env::temp_dir().join(format!("browsectl-{}", short))
    }
}

impl Endpoint {
    /// Open a client connection
    pub async fn connect(&self) -> std::io::Result<BoxStream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Whether something accepts connections here
    pub async fn is_live(&self) -> bool {
        self.connect().await.is_ok()
    }

    /// Bind a listener, replacing a stale socket file left by a dead daemon
    pub async fn bind(&self) -> Result<Listener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = match UnixListener::bind(path) {
                    Ok(listener) => listener,
                    Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                        if self.is_live().await {
                            return Err(BrowseError::Io(std::io::Error::new(
                                std::io::ErrorKind::AddrInUse,
                                format!("daemon already running at {}", path.display()),
                            )));
                        }
                        tracing::debug!(path = %path.display(), "replacing stale socket");
                        remove_if_exists(path)?;
                        UnixListener::bind(path)?
                    }
                    Err(e) => return Err(e.into()),
                };
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// Remove the socket file, if any
    pub fn cleanup(&self) {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if let Err(e) = remove_if_exists(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove socket");
                }
            }
            Endpoint::Tcp(_) => {}
        }
    }
}

/// Loopback endpoint for a port
pub fn tcp_endpoint(port: u16) -> Endpoint {
    Endpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bound listener for either transport
#[derive(Debug)]
pub enum Listener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    pub async fn accept(&self) -> std::io::Result<BoxStream> {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Endpoint clients use to reach this listener
    pub fn endpoint(&self) -> std::io::Result<Endpoint> {
        match self {
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
        }
    }
}
