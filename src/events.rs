use std::io;
use std::os::unix::io::OwnedFd;
use std::time::Duration;

use crate::addr::Addr;
use crate::conn::Conn;
use crate::ringbuffer::RingBuffer;

/// Directive returned from every callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close this connection once the current callback returns.
    Close,
    /// Close every connection and stop the server gracefully.
    Shutdown,
    /// Remove the connection from its loop and hand the raw fd to the
    /// embedder through `Events::detached`.
    Detach,
}

/// How new connections are spread over the loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

/// Per-connection socket options, returned from `Events::opened`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    /// Enable SO_KEEPALIVE with this probe idle time and interval. Only
    /// applied to TCP connections.
    pub tcp_keep_alive: Option<Duration>,
}

/// Facts about a serving instance, passed to `Events::serving`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub num_loops: usize,
    pub addrs: Vec<Addr>,
}

/// The callback set an embedder supplies to [`serve`](crate::serve).
///
/// Every callback runs on the loop thread owning the connection at hand and
/// must not block; long work belongs on the embedder's own threads, which
/// talk back through [`Conn::send`] and [`Conn::wake`].
pub trait Events: Send + Sync + 'static {
    /// Opaque per-connection user data, reachable through
    /// [`Conn::set_context`] and friends.
    type Context: Send + 'static;

    /// Invoked once when the server is ready to accept. Returning
    /// `Action::Shutdown` aborts startup.
    fn serving(&self, _srv: &ServerInfo) -> Action {
        Action::None
    }

    /// A new connection was accepted. The returned bytes are sent to the
    /// peer before anything else.
    fn opened(&self, _conn: &Conn<Self::Context>) -> (Vec<u8>, Opts, Action) {
        (Vec::new(), Opts::default(), Action::None)
    }

    /// Inbound bytes arrived. `input` holds everything not yet retrieved;
    /// the callback consumes what it can parse and leaves the rest.
    fn data(&self, _conn: &Conn<Self::Context>, _input: &mut RingBuffer) -> (Vec<u8>, Action) {
        (Vec::new(), Action::None)
    }

    /// The connection is gone. `err` carries the terminating cause, if any
    /// (peer reset, idle timeout); a clean EOF or local close passes None.
    fn closed(&self, _conn: &Conn<Self::Context>, _err: Option<&io::Error>) -> Action {
        Action::None
    }

    /// An `Action::Detach` completed; the fd is the embedder's now. The
    /// default drops it, which closes the socket.
    fn detached(&self, _conn: &Conn<Self::Context>, _fd: OwnedFd) -> Action {
        Action::None
    }

    /// Optional periodic callback. Return `Some((delay, action))` to run
    /// again `delay` later; the first invocation happens right after the
    /// loops start. Returning None stops the ticking.
    fn tick(&self) -> Option<(Duration, Action)> {
        None
    }
}
