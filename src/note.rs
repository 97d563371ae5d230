use crate::conn::Conn;

/// Cross-thread message delivered to a loop through its poller, alongside
/// readiness events. Every variant is matched exhaustively by the loop's
/// dispatcher.
pub(crate) enum Note<C> {
    /// Tear the loop down: close every owned connection and unwind `wait`.
    Shutdown,
    /// Visit a connection on its owning loop: drain pending work, then
    /// re-check its close flag.
    Wake(Conn<C>),
    /// A connection accepted on another loop, to be registered here.
    Register(Conn<C>),
    /// Periodic idle-timeout sweep, rescheduled through the timing wheel.
    Sweep,
    /// User tick callback, rescheduled through the timing wheel.
    Tick,
}
