use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{EPOLLET, EPOLLIN, EPOLLOUT, EPOLLPRI};

use super::eventfd::EventFd;
use crate::queue::NoteQueue;

/// Readiness notifier built on epoll.
///
/// All registrations are edge-triggered; consumers must drain a ready fd
/// until `WouldBlock` before the next notification for it is delivered.
/// `trigger` may be called from any thread and guarantees that a concurrent
/// or subsequent `wait` returns and drains the note.
pub struct Poller<N> {
    epfd: OwnedFd,
    wake: EventFd,
    notes: NoteQueue<N>,
}

impl<N> Poller<N> {
    pub fn new() -> io::Result<Poller<N>> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
        let wake = EventFd::new()?;

        let poller = Poller {
            epfd,
            wake,
            notes: NoteQueue::new(),
        };

        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.wake.as_raw_fd(),
            EPOLLIN | EPOLLET,
        )?;

        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: libc::c_int) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: events as u32,
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut info))?;

        Ok(())
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, EPOLLIN | EPOLLET | EPOLLPRI)
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, EPOLLIN | EPOLLOUT | EPOLLET)
    }

    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, EPOLLIN | EPOLLET | EPOLLPRI)
    }

    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, EPOLLIN | EPOLLOUT | EPOLLET)
    }

    pub fn mod_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, EPOLLOUT | EPOLLET)
    }

    pub fn mod_detach(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Enqueue a note and wake the loop blocked in `wait`. The eventfd write
    /// is elided when the queue already holds undrained notes; the note queue
    /// guarantees the draining loop picks those up before going back to
    /// sleep.
    pub fn trigger(&self, note: N) -> io::Result<()> {
        if self.notes.add(note) {
            match self.wake.write(1) {
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                other => other?,
            }
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

    /// Block until readiness events or a trigger arrive, invoking `iter` with
    /// `(fd, None)` for every ready fd and `(0, Some(note))` for every queued
    /// note. Returns only when `iter` fails; EINTR is absorbed.
    pub fn wait(
        &self,
        mut iter: impl FnMut(RawFd, Option<N>) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(128);

        loop {
            let n = match syscall!(epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as libc::c_int,
                -1
            )) {
                Ok(n) => n as usize,
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            };

            unsafe { events.set_len(n) };

            for i in 0..n {
                let fd = events[i].u64 as RawFd;

                if fd == self.wake.as_raw_fd() {
                    match self.wake.read() {
                        Ok(_) => {}
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => return Err(err),
                    }
                } else {
                    iter(fd, None)?;
                }
            }

            self.notes.drain(|note| iter(0, Some(note)))?;
        }
    }
}

impl<N> AsRawFd for Poller<N> {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}
