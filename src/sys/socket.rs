//! Raw socket plumbing shared by the listener and the event loop. Everything
//! here works on non-blocking, close-on-exec descriptors.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use crate::addr::Addr;

/// A raw socket address as the kernel hands it out, kept around so UDP
/// replies can go back to the exact same endpoint.
pub struct RawAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawAddr {
    pub fn zeroed() -> RawAddr {
        RawAddr {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub fn from_inet(addr: &SocketAddr) -> RawAddr {
        let mut raw = RawAddr::zeroed();

        match addr {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(raw.as_mut_ptr() as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                raw.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(raw.as_mut_ptr() as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                raw.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }

        raw
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn len_mut(&mut self) -> &mut libc::socklen_t {
        &mut self.len
    }

    pub fn to_addr(&self) -> Addr {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                Addr::Inet(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                Addr::Inet(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            libc::AF_UNIX => {
                let sun = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_un) };
                let offset = sun_path_offset(sun);
                let len = self.len as usize;

                if len <= offset {
                    return Addr::Unix(None);
                }

                let path = unsafe {
                    std::slice::from_raw_parts(sun.sun_path.as_ptr() as *const u8, len - offset)
                };
                // trailing NUL plus abstract-namespace names are both treated
                // as unnamed peers
                let end = path.iter().position(|b| *b == 0).unwrap_or(path.len());
                let path = &path[..end];

                if path.is_empty() {
                    Addr::Unix(None)
                } else {
                    Addr::Unix(Some(PathBuf::from(
                        std::ffi::OsStr::from_bytes(path).to_os_string(),
                    )))
                }
            }
            _ => Addr::Unix(None),
        }
    }
}

fn sun_path_offset(sun: &libc::sockaddr_un) -> usize {
    let base = sun as *const _ as usize;
    let path = &sun.sun_path as *const _ as usize;
    path - base
}

fn new_socket(family: libc::c_int, ty: libc::c_int) -> io::Result<OwnedFd> {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let fd = syscall!(socket(
        family,
        ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let fd = {
        let fd = syscall!(socket(family, ty, 0))?;
        if let Err(err) = set_cloexec_nonblocking(fd) {
            let _ = syscall!(close(fd));
            return Err(err);
        }
        fd
    };

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_cloexec_nonblocking(fd: RawFd) -> io::Result<()> {
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
    Ok(())
}

fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    opt: libc::c_int,
    val: libc::c_int,
) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &val as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
    Ok(())
}

fn inet_family(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

pub fn tcp_listener(addr: &SocketAddr, reuseport: bool) -> io::Result<OwnedFd> {
    let fd = new_socket(inet_family(addr), libc::SOCK_STREAM)?;

    setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if reuseport {
        setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    }

    let raw = RawAddr::from_inet(addr);
    syscall!(bind(fd.as_raw_fd(), raw.as_ptr(), raw.len()))?;
    syscall!(listen(fd.as_raw_fd(), 1024))?;

    Ok(fd)
}

pub fn udp_socket(addr: &SocketAddr, reuseport: bool) -> io::Result<OwnedFd> {
    let fd = new_socket(inet_family(addr), libc::SOCK_DGRAM)?;

    if reuseport {
        setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    }

    let raw = RawAddr::from_inet(addr);
    syscall!(bind(fd.as_raw_fd(), raw.as_ptr(), raw.len()))?;

    Ok(fd)
}

pub fn unix_listener(path: &Path) -> io::Result<OwnedFd> {
    let fd = new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;

    let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path too long",
        ));
    }
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let len = (sun_path_offset(&sun) + bytes.len() + 1) as libc::socklen_t;
    syscall!(bind(
        fd.as_raw_fd(),
        &sun as *const _ as *const libc::sockaddr,
        len
    ))?;
    syscall!(listen(fd.as_raw_fd(), 1024))?;

    Ok(fd)
}

/// Accept one pending connection; the returned fd is non-blocking and
/// close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, RawAddr)> {
    let mut raw = RawAddr::zeroed();

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let sock = syscall!(accept4(
        fd,
        raw.as_mut_ptr(),
        raw.len_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
    ))?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let sock = {
        let sock = syscall!(accept(fd, raw.as_mut_ptr(), raw.len_mut()))?;
        if let Err(err) = set_cloexec_nonblocking(sock) {
            let _ = syscall!(close(sock));
            return Err(err);
        }
        sock
    };

    Ok((unsafe { OwnedFd::from_raw_fd(sock) }, raw))
}

pub fn local_addr(fd: RawFd) -> io::Result<Addr> {
    let mut raw = RawAddr::zeroed();
    syscall!(getsockname(fd, raw.as_mut_ptr(), raw.len_mut()))?;
    Ok(raw.to_addr())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len()))?;
    Ok(n as usize)
}

/// writev over the two spans of a ring buffer peek.
pub fn write2(fd: RawFd, head: &[u8], tail: &[u8]) -> io::Result<usize> {
    let iov = [
        libc::iovec {
            iov_base: head.as_ptr() as *mut libc::c_void,
            iov_len: head.len(),
        },
        libc::iovec {
            iov_base: tail.as_ptr() as *mut libc::c_void,
            iov_len: tail.len(),
        },
    ];
    let cnt = if tail.is_empty() { 1 } else { 2 };

    let n = syscall!(writev(fd, iov.as_ptr(), cnt))?;
    Ok(n as usize)
}

pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, RawAddr)> {
    let mut raw = RawAddr::zeroed();
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        raw.as_mut_ptr(),
        raw.len_mut()
    ))?;
    Ok((n as usize, raw))
}

pub fn send_to(fd: RawFd, buf: &[u8], to: &RawAddr) -> io::Result<usize> {
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        0,
        to.as_ptr(),
        to.len()
    ))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd))?;
    Ok(())
}

/// SO_KEEPALIVE with the probe idle time and interval both set to `secs`.
pub fn set_keepalive(fd: RawFd, secs: u32) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    setsockopt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPALIVE,
        secs as libc::c_int,
    )?;

    #[cfg(any(
        target_os = "linux",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    {
        setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            secs as libc::c_int,
        )?;
        setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            secs as libc::c_int,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn inet_round_trip() {
        let addr: SocketAddr = "127.0.0.1:5007".parse().unwrap();
        let raw = RawAddr::from_inet(&addr);
        assert_eq!(raw.to_addr(), Addr::Inet(addr));

        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let raw = RawAddr::from_inet(&addr);
        assert_eq!(raw.to_addr(), Addr::Inet(addr));
    }

    #[test]
    fn listener_has_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = tcp_listener(&addr, false).unwrap();
        let local = local_addr(fd.as_raw_fd()).unwrap();

        match local {
            Addr::Inet(sa) => assert_ne!(sa.port(), 0),
            other => panic!("unexpected addr: {:?}", other),
        }
    }
}
