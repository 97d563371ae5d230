use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Wrapper around an eventfd created with EFD_CLOEXEC | EFD_NONBLOCK.
/// view: http://man7.org/linux/man-pages/man2/eventfd.2.html
#[derive(Debug)]
pub struct EventFd {
    inner: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;

        Ok(EventFd {
            inner: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        syscall!(read(
            self.inner.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        syscall!(write(
            self.inner.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_block() {
        let eventfd = EventFd::new().unwrap();

        assert!(eventfd.write(0xfffffffffffffffe).is_ok());
        assert!(eventfd.write(0xfffffffffffffffe).is_err());
    }
}
