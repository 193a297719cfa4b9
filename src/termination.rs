//! Why a connection stopped being served. Surfaced to an optional daemon-level callback so a
//! host can account for (or alert on) abnormal shutdowns without threading bookkeeping through
//! every [`Handler`](crate::Handler).

/// Reason a connection reached its `Closed` state. Delivered exactly once per connection, after
/// the socket has already been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The client sent a `Connection: close` (or ran out of keep-alive requests) and the last
    /// response was written successfully.
    CompletedOk,
    /// A read or write exceeded its configured timeout.
    Timeout,
    /// Parsing or I/O failed; an error response was attempted before closing.
    WithError,
    /// The daemon itself is shutting down and force-closed the connection.
    DaemonShutdown,
    /// The client closed (or reset) the socket before a response could be sent.
    ClientAbort,
}

/// Callback invoked once per connection when it reaches [`TerminationReason`]'s corresponding
/// state. Mirrors the shape of [`ConnectionFilter`](crate::ConnectionFilter) — a plain `Fn`, not
/// an async trait, since bookkeeping here should never block the worker that owns the connection.
pub trait NotifyCompleted: Sync + Send + 'static {
    fn notify(&self, reason: TerminationReason);
}

impl<F: Fn(TerminationReason) + Sync + Send + 'static> NotifyCompleted for F {
    fn notify(&self, reason: TerminationReason) {
        self(reason)
    }
}
