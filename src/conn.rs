use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::trace;

use crate::addr::Addr;
use crate::note::Note;
use crate::ringbuffer::RingBuffer;
use crate::sys::socket;
use crate::sys::Poller;

/// Work enqueued by non-loop threads, executed on the owning loop against
/// the connection's loop-side state.
pub(crate) type Job<C> = Box<dyn FnOnce(&mut Session<C>, &Poller<Note<C>>) + Send>;

struct Inner<C> {
    fd: RawFd,
    addr_index: usize,
    local_addr: Addr,
    remote_addr: Addr,
    datagram: bool,
    epoch: Instant,
    // non-owning: a connection never keeps its loop alive
    poller: Weak<Poller<Note<C>>>,
    // seconds since epoch; written by the loop, read anywhere
    active: AtomicU64,
    to_close: AtomicBool,
    context: Mutex<Option<C>>,
    pending: Mutex<Vec<Job<C>>>,
}

/// Shared handle to a connection.
///
/// The loop that accepted the connection owns its buffers and its fd; this
/// handle is what callbacks receive and what may be cloned onto other
/// threads. Cross-thread interaction goes exclusively through [`Conn::send`],
/// [`Conn::wake`] and [`Conn::close`], all of which funnel into the owning
/// loop via its poller trigger.
pub struct Conn<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Conn<C> {
    fn clone(&self) -> Conn<C> {
        Conn {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + 'static> Conn<C> {
    pub(crate) fn new(
        fd: RawFd,
        addr_index: usize,
        local_addr: Addr,
        remote_addr: Addr,
        datagram: bool,
        epoch: Instant,
        poller: &Arc<Poller<Note<C>>>,
    ) -> Conn<C> {
        let conn = Conn {
            inner: Arc::new(Inner {
                fd,
                addr_index,
                local_addr,
                remote_addr,
                datagram,
                epoch,
                poller: Arc::downgrade(poller),
                active: AtomicU64::new(0),
                to_close: AtomicBool::new(false),
                context: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
            }),
        };
        conn.touch();
        conn
    }

    /// Queue `data` for delivery to the peer. Callable from any thread; the
    /// bytes take the direct write path once the owning loop picks the job
    /// up. Order is submission order per calling thread.
    ///
    /// Datagram connections are transient; reply to them through the bytes
    /// returned from the `data` callback instead.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        if self.inner.datagram {
            return;
        }

        let data: Vec<u8> = data.into();
        let mut pending = self.inner.pending.lock().unwrap();
        let first = pending.is_empty();

        pending.push(Box::new(move |session: &mut Session<C>, poller| {
            session.send(poller, &data);
        }));

        // the first appender wakes the loop; later appenders ride along.
        // deliberately still under the lock so enqueue and trigger pair up.
        if first {
            self.wake();
        }
    }

    /// Schedule the owning loop to visit this connection: pending jobs are
    /// drained and the close flag is re-checked.
    pub fn wake(&self) {
        if let Some(poller) = self.inner.poller.upgrade() {
            if let Err(err) = poller.trigger(Note::Wake(self.clone())) {
                trace!("wake fd {}: {}", self.inner.fd, err);
            }
        }
    }

    /// Ask the owning loop to close this connection. The `closed` callback
    /// fires on the loop thread; queued outbound bytes are dropped.
    pub fn close(&self) {
        self.inner.to_close.store(true, Ordering::Release);
        self.wake();
    }

    pub fn set_context(&self, context: C) {
        *self.inner.context.lock().unwrap() = Some(context);
    }

    pub fn take_context(&self) -> Option<C> {
        self.inner.context.lock().unwrap().take()
    }

    /// Run `f` with a mutable borrow of the context, if any.
    pub fn with_context<R>(&self, f: impl FnOnce(Option<&mut C>) -> R) -> R {
        let mut context = self.inner.context.lock().unwrap();
        f(context.as_mut())
    }

    pub fn local_addr(&self) -> &Addr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &Addr {
        &self.inner.remote_addr
    }

    /// Index of the listener this connection arrived on.
    pub fn addr_index(&self) -> usize {
        self.inner.addr_index
    }

    /// Time since the last inbound activity, at one-second granularity.
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs())
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub(crate) fn is_datagram(&self) -> bool {
        self.inner.datagram
    }

    pub(crate) fn touch(&self) {
        self.inner
            .active
            .store(self.inner.epoch.elapsed().as_secs(), Ordering::Release);
    }

    pub(crate) fn idle_secs(&self) -> u64 {
        self.inner
            .epoch
            .elapsed()
            .as_secs()
            .saturating_sub(self.inner.active.load(Ordering::Acquire))
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.inner.to_close.load(Ordering::Acquire)
    }

    pub(crate) fn request_close(&self) {
        self.inner.to_close.store(true, Ordering::Release);
    }

    pub(crate) fn take_jobs(&self) -> Vec<Job<C>> {
        std::mem::take(&mut *self.inner.pending.lock().unwrap())
    }

    pub(crate) fn clear_jobs(&self) {
        self.inner.pending.lock().unwrap().clear();
    }

    pub(crate) fn ptr_eq(a: &Conn<C>, b: &Conn<C>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<C> std::fmt::Debug for Conn<C> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Conn")
            .field("fd", &self.inner.fd)
            .field("remote", &self.inner.remote_addr)
            .finish()
    }
}

/// How a session's fd is currently registered with the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Read,
    ReadWrite,
    Write,
}

/// Loop-owned connection state: the staging buffers and the poller interest
/// bookkeeping. Lives in the loop's fd table and is never observed by other
/// threads.
pub(crate) struct Session<C> {
    pub(crate) conn: Conn<C>,
    pub(crate) input: RingBuffer,
    pub(crate) output: RingBuffer,
    read_on: bool,
    armed: Interest,
    high_water: usize,
}

impl<C: Send + 'static> Session<C> {
    pub fn new(conn: Conn<C>, high_water: usize) -> Session<C> {
        Session {
            conn,
            input: RingBuffer::new(),
            output: RingBuffer::new(),
            read_on: true,
            armed: Interest::Read,
            high_water,
        }
    }

    pub fn split(&mut self) -> (&Conn<C>, &mut RingBuffer) {
        (&self.conn, &mut self.input)
    }

    /// The loop-side send path: append behind queued output to preserve
    /// order, otherwise attempt a direct write and stage whatever the socket
    /// did not take.
    pub fn send(&mut self, poller: &Poller<Note<C>>, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if !self.output.is_empty() {
            self.output.write(data);
        } else {
            match socket::write(self.conn.fd(), data) {
                Ok(n) if n < data.len() => {
                    self.output.write(&data[n..]);
                }
                Ok(_) => {}
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    self.output.write(data);
                }
                Err(err) => {
                    trace!("write fd {}: {}", self.conn.fd(), err);
                    self.conn.request_close();
                    return;
                }
            }
        }

        self.after_output_change(poller);
    }

    /// Drain staged output into the socket until empty or the socket stops
    /// taking bytes. A hard error is the caller's cue to close.
    pub fn flush(&mut self, poller: &Poller<Note<C>>) -> io::Result<()> {
        while !self.output.is_empty() {
            let (head, tail) = self.output.peek_all();
            match socket::write2(self.conn.fd(), head, tail) {
                Ok(0) => break,
                Ok(n) => self.output.retrieve(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        self.after_output_change(poller);
        Ok(())
    }

    /// Back-pressure bookkeeping plus interest re-arming, after any change
    /// to the output buffer.
    fn after_output_change(&mut self, poller: &Poller<Note<C>>) {
        if self.read_on && self.output.len() > self.high_water {
            self.read_on = false;
        } else if !self.read_on && self.output.len() < self.high_water / 2 {
            self.read_on = true;
        }

        let want = match (self.read_on, !self.output.is_empty()) {
            (true, false) => Interest::Read,
            (true, true) => Interest::ReadWrite,
            (false, true) => Interest::Write,
            // read interest is only ever dropped while output is queued
            (false, false) => Interest::Read,
        };

        if want != self.armed {
            let fd = self.conn.fd();
            let res = match want {
                Interest::Read => poller.mod_read(fd),
                Interest::ReadWrite => poller.mod_read_write(fd),
                Interest::Write => poller.mod_write(fd),
            };

            match res {
                Ok(()) => self.armed = want,
                Err(err) => {
                    trace!("rearm fd {}: {}", fd, err);
                    self.conn.request_close();
                }
            }
        }
    }
}
