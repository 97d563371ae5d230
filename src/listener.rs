use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use crate::addr::Addr;
use crate::sys::socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Network {
    Tcp,
    Udp,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

/// A listening socket, created once at startup and registered read-only on
/// every loop's poller.
pub(crate) struct Listener {
    network: Network,
    uri: String,
    local: Addr,
    fd: OwnedFd,
    // unlinked when the listener goes away
    unix_path: Option<PathBuf>,
}

impl Listener {
    /// Bind a listen URI of the form `scheme://host:port?reuseport=true`,
    /// scheme one of tcp/tcp4/tcp6/udp/udp4/udp6/unix. A bare `host:port`
    /// defaults to tcp.
    pub fn bind(uri: &str) -> io::Result<Listener> {
        let parsed = parse(uri)?;

        match parsed.network {
            Network::Unix => {
                let path = PathBuf::from(&parsed.addr);
                if path.as_os_str().is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("missing unix socket path in {:?}", uri),
                    ));
                }

                // a stale socket file from a previous run would fail the bind
                let _ = fs::remove_file(&path);

                let fd = socket::unix_listener(&path)?;
                Ok(Listener {
                    network: Network::Unix,
                    uri: uri.to_string(),
                    local: Addr::Unix(Some(path.clone())),
                    fd,
                    unix_path: Some(path),
                })
            }
            Network::Tcp | Network::Udp => {
                let sockaddr = resolve(&parsed.addr, parsed.family)?;
                let fd = match parsed.network {
                    Network::Tcp => socket::tcp_listener(&sockaddr, parsed.reuseport)?,
                    _ => socket::udp_socket(&sockaddr, parsed.reuseport)?,
                };
                let local = socket::local_addr(fd.as_raw_fd())?;

                Ok(Listener {
                    network: parsed.network,
                    uri: uri.to_string(),
                    local,
                    fd,
                    unix_path: None,
                })
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn local_addr(&self) -> &Addr {
        &self.local
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_datagram(&self) -> bool {
        self.network == Network::Udp
    }

    pub fn is_tcp(&self) -> bool {
        self.network == Network::Tcp
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = fs::remove_file(path);
        }
    }
}

struct Parsed {
    network: Network,
    family: Family,
    addr: String,
    reuseport: bool,
}

fn parse(uri: &str) -> io::Result<Parsed> {
    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", uri),
    };

    let (addr, query) = rest.split_once('?').unwrap_or((rest, ""));

    let (network, family) = match scheme {
        "tcp" => (Network::Tcp, Family::Any),
        "tcp4" => (Network::Tcp, Family::V4),
        "tcp6" => (Network::Tcp, Family::V6),
        "udp" => (Network::Udp, Family::Any),
        "udp4" => (Network::Udp, Family::V4),
        "udp6" => (Network::Udp, Family::V6),
        "unix" => (Network::Unix, Family::Any),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported scheme {:?} in {:?}", other, uri),
            ))
        }
    };

    let reuseport = query
        .split('&')
        .any(|pair| pair == "reuseport=true" || pair == "reuseport=1");

    Ok(Parsed {
        network,
        family,
        addr: addr.to_string(),
        reuseport,
    })
}

fn resolve(addr: &str, family: Family) -> io::Result<SocketAddr> {
    // ":5007" means every interface, in the address family asked for
    let hostport = if addr.starts_with(':') {
        match family {
            Family::V6 => format!("[::]{}", addr),
            _ => format!("0.0.0.0{}", addr),
        }
    } else {
        addr.to_string()
    };

    let matches = |sockaddr: &SocketAddr| match family {
        Family::Any => true,
        Family::V4 => sockaddr.is_ipv4(),
        Family::V6 => sockaddr.is_ipv6(),
    };

    hostport
        .to_socket_addrs()?
        .find(matches)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no matching address for {:?}", addr),
            )
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_schemes() {
        let parsed = parse("tcp://:5007?reuseport=true").unwrap();
        assert_eq!(parsed.network, Network::Tcp);
        assert_eq!(parsed.family, Family::Any);
        assert_eq!(parsed.addr, ":5007");
        assert!(parsed.reuseport);

        let parsed = parse("udp6://[::1]:9000").unwrap();
        assert_eq!(parsed.network, Network::Udp);
        assert_eq!(parsed.family, Family::V6);
        assert!(!parsed.reuseport);

        let parsed = parse("unix:///tmp/echo.sock").unwrap();
        assert_eq!(parsed.network, Network::Unix);
        assert_eq!(parsed.addr, "/tmp/echo.sock");

        assert!(parse("http://:80").is_err());
    }

    #[test]
    fn bare_address_defaults_to_tcp() {
        let parsed = parse("127.0.0.1:5007").unwrap();
        assert_eq!(parsed.network, Network::Tcp);
        assert_eq!(parsed.addr, "127.0.0.1:5007");
    }

    #[test]
    fn resolve_wildcard() {
        let sockaddr = resolve(":5007", Family::Any).unwrap();
        assert!(sockaddr.ip().is_unspecified());
        assert_eq!(sockaddr.port(), 5007);

        let sockaddr = resolve(":5007", Family::V6).unwrap();
        assert!(sockaddr.is_ipv6());
    }

    #[test]
    fn bind_ephemeral_tcp() {
        let listener = Listener::bind("tcp://127.0.0.1:0").unwrap();
        assert!(listener.is_tcp());
        match listener.local_addr() {
            Addr::Inet(sockaddr) => assert_ne!(sockaddr.port(), 0),
            other => panic!("unexpected addr: {:?}", other),
        }
    }
}
