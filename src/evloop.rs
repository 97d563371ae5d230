//! The per-thread event loop: drives the poller, accepts, reads, writes,
//! invokes the user callbacks and enforces the idle timeout. Every mutation
//! of connection state happens here, on the loop's own thread; other threads
//! only ever reach a loop through `Poller::trigger`.

use std::cmp;
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, trace, warn};
use rand::Rng;

use crate::conn::{Conn, Session};
use crate::events::{Action, Events, LoadBalance};
use crate::note::Note;
use crate::ringbuffer::RingBuffer;
use crate::server::{closing, is_closing, LoopShared, Shared};
use crate::sys::socket;
use crate::sys::Poller;

// scratch buffer for one read or one datagram
const PACKET_SIZE: usize = 64 * 1024;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// State only ever touched by the owning loop thread.
struct LoopState<C> {
    fdconns: IndexMap<RawFd, Session<C>>,
    packet: Vec<u8>,
}

pub(crate) fn run<E: Events>(server: Arc<Shared<E>>, idx: usize) {
    let me = &server.loops[idx];
    let mut state = LoopState {
        fdconns: IndexMap::new(),
        packet: vec![0u8; PACKET_SIZE],
    };

    // the first tick fires as soon as the loop is up; the handler
    // reschedules itself through the wheel
    if idx == 0 {
        let _ = me.poller.trigger(Note::Tick);
    }
    if server.config.wait_timeout.is_some() {
        schedule_sweep(me);
    }

    let poller = me.poller.clone();
    let err = {
        let mut driver = Driver {
            server: &server,
            me,
            state: &mut state,
        };
        match poller.wait(|fd, note| driver.dispatch(fd, note)) {
            Ok(()) => closing(),
            Err(err) => err,
        }
    };

    if is_closing(&err) {
        debug!("loop {} shutting down", idx);
    } else {
        error!("loop {} failed: {}", idx, err);
    }

    // queued notes are dead now; adopt and close any connection that was
    // mid-handoff so its fd does not leak
    me.poller.purge(|note| {
        if let Note::Register(conn) = note {
            let _ = socket::close(conn.fd());
        }
    });

    for (fd, session) in state.fdconns.drain(..) {
        let _ = me.poller.mod_detach(fd);
        let _ = socket::close(fd);
        session.conn.clear_jobs();
        me.conns.fetch_sub(1, Ordering::Relaxed);
        let _ = server.events.closed(&session.conn, None);
    }

    me.wheel.stop();
    server.signal_exit();
}

fn schedule_sweep<C: Send + 'static>(me: &LoopShared<C>) {
    let poller = me.poller.clone();
    let _ = me.wheel.after_func(SWEEP_INTERVAL, move || {
        let _ = poller.trigger(Note::Sweep);
    });
}

struct Driver<'a, E: Events> {
    server: &'a Shared<E>,
    me: &'a LoopShared<E::Context>,
    state: &'a mut LoopState<E::Context>,
}

impl<'a, E: Events> Driver<'a, E> {
    fn dispatch(&mut self, fd: RawFd, note: Option<Note<E::Context>>) -> io::Result<()> {
        match note {
            Some(Note::Shutdown) => Err(closing()),
            Some(Note::Wake(conn)) => self.visit(conn),
            Some(Note::Register(conn)) => self.register(conn),
            Some(Note::Sweep) => self.sweep(),
            Some(Note::Tick) => self.tick(),
            None => {
                if let Some(lnidx) = self.server.listener_index(fd) {
                    if self.server.listeners[lnidx].is_datagram() {
                        self.serve_datagrams(lnidx)
                    } else {
                        self.accept(lnidx)
                    }
                } else if self.state.fdconns.contains_key(&fd) {
                    self.serve_conn(fd)
                } else {
                    // readiness raced with a close
                    Ok(())
                }
            }
        }
    }

    /// Edge-triggered accept: take connections until the listener is dry,
    /// spreading them over the loops per the balance policy. A connection
    /// destined for another loop is handed over as a note.
    fn accept(&mut self, lnidx: usize) -> io::Result<()> {
        let (lnfd, local) = {
            let ln = &self.server.listeners[lnidx];
            (ln.fd(), ln.local_addr().clone())
        };

        loop {
            let (sock, raw) = match socket::accept(lnfd) {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // EMFILE/ENFILE and transient peer failures must not
                    // bring the loop down
                    warn!("accept on {}: {}", self.server.listeners[lnidx].uri(), err);
                    return Ok(());
                }
            };

            let target = self.choose_loop();
            let conn = Conn::new(
                sock.into_raw_fd(),
                lnidx,
                local.clone(),
                raw.to_addr(),
                false,
                self.server.epoch,
                &self.server.loops[target].poller,
            );

            if target == self.me.idx {
                self.register(conn)?;
            } else {
                trace!("fd {} handed to loop {}", conn.fd(), target);
                if let Err(err) = self.server.loops[target]
                    .poller
                    .trigger(Note::Register(conn))
                {
                    trace!("handoff to loop {}: {}", target, err);
                }
            }
        }
    }

    fn choose_loop(&self) -> usize {
        let n = self.server.loops.len();
        if n == 1 {
            return 0;
        }

        match self.server.config.load_balance {
            LoadBalance::RoundRobin => self.server.accepted.fetch_add(1, Ordering::Relaxed) % n,
            LoadBalance::Random => rand::rng().random_range(0..n),
            LoadBalance::LeastConnections => self
                .server
                .loops
                .iter()
                .enumerate()
                .min_by_key(|(_, lp)| lp.conns.load(Ordering::Relaxed))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        }
    }

    /// Take ownership of a fresh connection: arm the poller, deliver
    /// `opened`, apply socket options and flush the greeting bytes.
    fn register(&mut self, conn: Conn<E::Context>) -> io::Result<()> {
        let fd = conn.fd();

        if let Err(err) = self.me.poller.add_read(fd) {
            warn!("register fd {}: {}", fd, err);
            let _ = socket::close(fd);
            return Ok(());
        }

        conn.touch();
        self.me.conns.fetch_add(1, Ordering::Relaxed);
        self.state.fdconns.insert(
            fd,
            Session::new(conn.clone(), self.server.config.high_water_mark),
        );

        let (out, opts, action) = self.server.events.opened(&conn);

        if let Some(keep_alive) = opts.tcp_keep_alive {
            if self.server.listeners[conn.addr_index()].is_tcp() {
                if let Err(err) = socket::set_keepalive(fd, keep_alive.as_secs() as u32) {
                    trace!("keepalive fd {}: {}", fd, err);
                }
            }
        }

        if !out.is_empty() {
            if let Some(session) = self.state.fdconns.get_mut(&fd) {
                session.send(&self.me.poller, &out);
            }
        }

        self.handle_action(action, fd)?;
        self.close_if_requested(fd)
    }

    /// Readiness on a connection fd: flush staged output, then drain the
    /// socket and hand whatever arrived to the `data` callback.
    fn serve_conn(&mut self, fd: RawFd) -> io::Result<()> {
        let (action, end) = {
            let LoopState { fdconns, packet } = &mut *self.state;
            let Some(session) = fdconns.get_mut(&fd) else {
                return Ok(());
            };
            pump_conn(&self.server.events, &self.me.poller, session, packet)
        };

        self.handle_action(action, fd)?;
        if let Some(cause) = end {
            return self.close_conn(fd, cause);
        }
        self.close_if_requested(fd)
    }

    /// Deliver queued cross-thread work to a connection, then honor a close
    /// request. Stale wakes (the fd was reused or the connection is gone)
    /// are dropped along with their jobs.
    fn visit(&mut self, conn: Conn<E::Context>) -> io::Result<()> {
        let fd = conn.fd();
        let jobs = conn.take_jobs();

        {
            let Some(session) = self.state.fdconns.get_mut(&fd) else {
                return Ok(());
            };
            if !Conn::ptr_eq(&session.conn, &conn) {
                return Ok(());
            }
            for job in jobs {
                job(session, &self.me.poller);
            }
        }

        if conn.wants_close()
            && self
                .state
                .fdconns
                .get(&fd)
                .is_some_and(|s| Conn::ptr_eq(&s.conn, &conn))
        {
            return self.close_conn(fd, None);
        }

        Ok(())
    }

    /// Close every connection quiet for longer than the configured timeout,
    /// then re-arm the sweep.
    fn sweep(&mut self) -> io::Result<()> {
        let Some(timeout) = self.server.config.wait_timeout else {
            return Ok(());
        };
        let timeout = cmp::max(1, timeout.as_secs());

        let expired: Vec<RawFd> = self
            .state
            .fdconns
            .iter()
            .filter(|(_, session)| session.conn.idle_secs() >= timeout)
            .map(|(fd, _)| *fd)
            .collect();

        for fd in expired {
            self.close_conn(fd, Some(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")))?;
        }

        schedule_sweep(self.me);
        Ok(())
    }

    fn tick(&mut self) -> io::Result<()> {
        let Some((delay, action)) = self.server.events.tick() else {
            return Ok(());
        };

        if action == Action::Shutdown {
            return Err(closing());
        }

        let poller = self.me.poller.clone();
        let _ = self.me.wheel.after_func(delay, move || {
            let _ = poller.trigger(Note::Tick);
        });

        Ok(())
    }

    fn handle_action(&mut self, action: Action, fd: RawFd) -> io::Result<()> {
        match action {
            Action::None => Ok(()),
            Action::Close => self.close_conn(fd, None),
            Action::Shutdown => Err(closing()),
            Action::Detach => self.detach(fd),
        }
    }

    fn close_if_requested(&mut self, fd: RawFd) -> io::Result<()> {
        if self
            .state
            .fdconns
            .get(&fd)
            .is_some_and(|session| session.conn.wants_close())
        {
            return self.close_conn(fd, None);
        }
        Ok(())
    }

    /// Tear a connection down: unregister, close the fd, cancel pending
    /// work, deliver `closed` with the captured cause.
    fn close_conn(&mut self, fd: RawFd, err: Option<io::Error>) -> io::Result<()> {
        let Some(session) = self.state.fdconns.swap_remove(&fd) else {
            return Ok(());
        };

        self.me.conns.fetch_sub(1, Ordering::Relaxed);
        if let Err(err) = self.me.poller.mod_detach(fd) {
            trace!("detach fd {}: {}", fd, err);
        }
        let _ = socket::close(fd);
        session.conn.clear_jobs();

        match self.server.events.closed(&session.conn, err.as_ref()) {
            Action::Shutdown => Err(closing()),
            _ => Ok(()),
        }
    }

    /// Remove the connection from the loop without closing the socket; the
    /// fd's lifetime is the embedder's problem from here on.
    fn detach(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(session) = self.state.fdconns.swap_remove(&fd) else {
            return Ok(());
        };

        self.me.conns.fetch_sub(1, Ordering::Relaxed);
        if let Err(err) = self.me.poller.mod_detach(fd) {
            trace!("detach fd {}: {}", fd, err);
        }
        session.conn.clear_jobs();

        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        match self.server.events.detached(&session.conn, owned) {
            Action::Shutdown => Err(closing()),
            _ => Ok(()),
        }
    }

    /// Stateless datagram service: each datagram is presented to `data`
    /// through a transient connection and answered in place. Nothing is
    /// retained afterwards.
    fn serve_datagrams(&mut self, lnidx: usize) -> io::Result<()> {
        let (lnfd, local) = {
            let ln = &self.server.listeners[lnidx];
            (ln.fd(), ln.local_addr().clone())
        };

        loop {
            let (n, raw) = {
                let LoopState { packet, .. } = &mut *self.state;
                match socket::recv_from(lnfd, packet) {
                    Ok(pair) => pair,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(
                            "recvfrom on {}: {}",
                            self.server.listeners[lnidx].uri(),
                            err
                        );
                        return Ok(());
                    }
                }
            };

            let conn = Conn::new(
                lnfd,
                lnidx,
                local.clone(),
                raw.to_addr(),
                true,
                self.server.epoch,
                &self.me.poller,
            );

            let mut input = RingBuffer::with_capacity(n);
            input.write(&self.state.packet[..n]);

            let (out, action) = self.server.events.data(&conn, &mut input);

            if !out.is_empty() {
                if let Err(err) = socket::send_to(lnfd, &out, &raw) {
                    trace!("sendto {}: {}", conn.remote_addr(), err);
                }
            }

            if action == Action::Shutdown {
                return Err(closing());
            }
        }
    }
}

/// The flush-then-read pump for one ready connection. Returns the action the
/// `data` callback asked for, plus `Some(cause)` when the connection has to
/// close (EOF, reset, write failure).
fn pump_conn<E: Events>(
    events: &E,
    poller: &Poller<Note<E::Context>>,
    session: &mut Session<E::Context>,
    packet: &mut [u8],
) -> (Action, Option<Option<io::Error>>) {
    if !session.output.is_empty() {
        if let Err(err) = session.flush(poller) {
            return (Action::None, Some(Some(err)));
        }
    }

    let mut received = 0usize;
    let mut end = None;

    loop {
        match socket::read(session.conn.fd(), packet) {
            Ok(0) => {
                end = Some(None);
                break;
            }
            Ok(n) => {
                session.input.write(&packet[..n]);
                received += n;
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                end = Some(Some(err));
                break;
            }
        }
    }

    let mut action = Action::None;
    if received > 0 {
        session.conn.touch();
        let (conn, input) = session.split();
        let (out, act) = events.data(conn, input);
        action = act;
        if !out.is_empty() {
            session.send(poller, &out);
        }
    }

    (action, end)
}
