use std::error::Error;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::events::{Action, Events, LoadBalance, ServerInfo};
use crate::evloop;
use crate::listener::Listener;
use crate::note::Note;
use crate::sys::Poller;
use crate::timingwheel::TimingWheel;

/// Default outbound high-water mark: 16 MiB per connection.
pub const DEFAULT_HIGH_WATER: usize = 16 << 20;

// idle sweeping granularity
const WHEEL_TICK: Duration = Duration::from_secs(1);
const WHEEL_SIZE: usize = 60;

/// Server-wide settings, fixed for the lifetime of a `serve` call.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of event loops: 0 means one, a negative value means one per
    /// CPU, a positive value is taken as given.
    pub num_loops: i32,
    pub load_balance: LoadBalance,
    /// Close connections with no inbound traffic for this long. None
    /// disables idle sweeping.
    pub wait_timeout: Option<Duration>,
    /// Above this many staged outbound bytes a connection stops reading
    /// until the peer drains half of it.
    pub high_water_mark: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_loops: 0,
            load_balance: LoadBalance::RoundRobin,
            wait_timeout: None,
            high_water_mark: DEFAULT_HIGH_WATER,
        }
    }
}

/// Shutdown sentinel carried inside an `io::Error`; unwinds `Poller::wait`
/// without being a real failure.
#[derive(Debug)]
pub(crate) struct Closing;

impl fmt::Display for Closing {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "closing")
    }
}

impl Error for Closing {}

pub(crate) fn closing() -> io::Error {
    io::Error::other(Closing)
}

pub(crate) fn is_closing(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<Closing>())
}

/// Per-loop handles shared between the supervisor, the loop thread and the
/// connections it owns.
pub(crate) struct LoopShared<C> {
    pub idx: usize,
    pub poller: Arc<Poller<Note<C>>>,
    pub wheel: TimingWheel,
    pub conns: AtomicUsize,
}

pub(crate) struct Shared<E: Events> {
    pub events: E,
    pub config: Config,
    pub listeners: Vec<Listener>,
    pub loops: Vec<LoopShared<E::Context>>,
    pub accepted: AtomicUsize,
    pub epoch: Instant,
    exited: Mutex<usize>,
    exit_signal: Condvar,
}

impl<E: Events> Shared<E> {
    pub fn listener_index(&self, fd: RawFd) -> Option<usize> {
        self.listeners.iter().position(|ln| ln.fd() == fd)
    }

    pub fn signal_exit(&self) {
        *self.exited.lock().unwrap() += 1;
        self.exit_signal.notify_all();
    }

    fn wait_exit(&self) {
        let mut exited = self.exited.lock().unwrap();
        while *exited == 0 {
            exited = self.exit_signal.wait(exited).unwrap();
        }
    }
}

/// Bind the given listen URIs and serve them with `events` until a callback
/// returns `Action::Shutdown` or a loop hits a fatal poller error.
///
/// Each loop runs on its own thread and owns the connections balanced onto
/// it; the calling thread blocks until the whole server has wound down.
pub fn serve<E: Events>(events: E, config: Config, addrs: &[&str]) -> io::Result<()> {
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no listen addresses",
        ));
    }

    let mut listeners = Vec::with_capacity(addrs.len());
    for uri in addrs {
        listeners.push(Listener::bind(uri)?);
    }

    let num_loops = match config.num_loops {
        0 => 1,
        n if n < 0 => thread::available_parallelism()
            .map(|cpus| cpus.get())
            .unwrap_or(1),
        n => n as usize,
    };

    let mut loops = Vec::with_capacity(num_loops);
    for idx in 0..num_loops {
        let poller = Arc::new(Poller::new()?);
        // every loop accepts from every listener
        for ln in &listeners {
            poller.add_read(ln.fd())?;
        }

        loops.push(LoopShared {
            idx,
            poller,
            wheel: TimingWheel::new(WHEEL_TICK, WHEEL_SIZE),
            conns: AtomicUsize::new(0),
        });
    }

    let server = Arc::new(Shared {
        events,
        config,
        listeners,
        loops,
        accepted: AtomicUsize::new(0),
        epoch: Instant::now(),
        exited: Mutex::new(0),
        exit_signal: Condvar::new(),
    });

    let info = ServerInfo {
        num_loops,
        addrs: server
            .listeners
            .iter()
            .map(|ln| ln.local_addr().clone())
            .collect(),
    };
    if let Action::Shutdown = server.events.serving(&info) {
        return Ok(());
    }

    for lp in &server.loops {
        lp.wheel.start()?;
    }

    let mut workers = Vec::with_capacity(num_loops);
    for idx in 0..num_loops {
        let server = server.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("loop-{}", idx))
                .spawn(move || evloop::run(server, idx))?,
        );
    }

    // the first loop to exit, clean or not, brings the rest down
    server.wait_exit();
    debug!("server shutting down");

    for lp in &server.loops {
        let _ = lp.poller.trigger(Note::Shutdown);
    }
    for worker in workers {
        let _ = worker.join();
    }

    Ok(())
}
