use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::queue::NoteQueue;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type Flags = libc::c_ushort;
#[cfg(target_os = "netbsd")]
type Flags = u32;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $fflags: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: $fflags,
            data: 0,
            udata: 0 as _,
        }
    };
}

// The EVFILT_USER wake event is registered under this ident; real fds are
// never 0 here because 0 is stdin.
const WAKE_IDENT: usize = 0;

/// Readiness notifier built on kqueue. Same contract as the epoll variant:
/// edge-triggered registrations (EV_CLEAR) and a cross-thread `trigger`
/// backed by an EVFILT_USER event.
pub struct Poller<N> {
    kq: OwnedFd,
    notes: NoteQueue<N>,
}

impl<N> Poller<N> {
    pub fn new() -> io::Result<Poller<N>> {
        let kq = syscall!(kqueue())?;
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;

        let poller = Poller {
            kq,
            notes: NoteQueue::new(),
        };

        poller.apply(&[kevent!(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0
        )])?;

        Ok(poller)
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as _,
            ptr::null_mut(),
            0,
            ptr::null()
        ))?;
        Ok(())
    }

    // EV_DELETE for a filter that was never registered reports ENOENT; the
    // mod_* operations express the full desired interest mask, so that case
    // is expected.
    fn apply_forgiving(&self, changes: &[libc::kevent]) -> io::Result<()> {
        for change in changes {
            match self.apply(std::slice::from_ref(change)) {
                Ok(()) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[kevent!(
            fd,
            libc::EVFILT_READ,
            libc::EV_ADD | libc::EV_CLEAR,
            0
        )])
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[
            kevent!(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR, 0),
        ])
    }

    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.apply_forgiving(&[
            kevent!(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
        ])
    }

    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.apply_forgiving(&[
            kevent!(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR, 0),
        ])
    }

    pub fn mod_write(&self, fd: RawFd) -> io::Result<()> {
        self.apply_forgiving(&[
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR, 0),
        ])
    }

    pub fn mod_detach(&self, fd: RawFd) -> io::Result<()> {
        self.apply_forgiving(&[
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
        ])
    }

    /// Enqueue a note and wake the loop blocked in `wait`. The NOTE_TRIGGER
    /// is elided when the queue already holds undrained notes.
    pub fn trigger(&self, note: N) -> io::Result<()> {
        if self.notes.add(note) {
            self.apply(&[kevent!(
                WAKE_IDENT,
                libc::EVFILT_USER,
                0,
                libc::NOTE_TRIGGER
            )])?;
        }

        Ok(())
    }

    /// Drop any notes still queued, handing each to `f` first.
    pub fn purge(&self, mut f: impl FnMut(N)) {
        let _ = self.notes.drain(|note| {
            f(note);
            Ok(())
        });
    }

    /// Block until readiness events or a trigger arrive; see the epoll
    /// variant for the dispatch contract.
    pub fn wait(
        &self,
        mut iter: impl FnMut(RawFd, Option<N>) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut events: Vec<libc::kevent> = Vec::with_capacity(128);

        loop {
            let n = match syscall!(kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                events.capacity() as _,
                ptr::null()
            )) {
                Ok(n) => n as usize,
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            };

            unsafe { events.set_len(n) };

            self.notes.drain(|note| iter(0, Some(note)))?;

            for i in 0..n {
                let ident = events[i].ident as usize;
                if ident != WAKE_IDENT {
                    iter(ident as RawFd, None)?;
                }
            }
        }
    }
}

impl<N> AsRawFd for Poller<N> {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}
