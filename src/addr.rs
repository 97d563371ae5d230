use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// An endpoint address: an IP socket address or a unix-domain path. Peers on
/// unnamed unix sockets carry `Unix(None)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Inet(SocketAddr),
    Unix(Option<PathBuf>),
}

impl Addr {
    /// The IP socket address, if this is an inet endpoint.
    pub fn inet(&self) -> Option<SocketAddr> {
        match self {
            Addr::Inet(addr) => Some(*addr),
            Addr::Unix(..) => None,
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Addr {
        Addr::Inet(addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Addr::Inet(addr) => write!(fmt, "{}", addr),
            Addr::Unix(Some(path)) => write!(fmt, "{}", path.display()),
            Addr::Unix(None) => write!(fmt, "unix:unnamed"),
        }
    }
}
