use crate::{
    errors::ErrorKind,
    http::{
        request::{Parser, Request},
        response::{DynContentReader, ReadOutcome, Response},
        types::Version,
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{
        server_impl::{AllLimits, Handler},
        tls::AsyncStream,
    },
    termination::{NotifyCompleted, TerminationReason},
    Handled,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{io::AsyncWriteExt, sync::watch, time::sleep};

/// Drives a single request/response cycle through an explicit state machine instead of a flat
/// pass, so a request whose headers or body arrive split across several socket reads resumes
/// from the right point instead of being reparsed from scratch or rejected outright.
#[derive(Debug)]
enum ConnectionState {
    /// About to start a new request on this connection (first one, or after keep-alive reset).
    Init,
    /// Accumulating bytes until the header block terminator has actually been seen.
    HeaderPartReceived,
    /// Header block present in the pool; about to run the line/header parser.
    HeadersReceived,
    /// Headers parsed; deciding between `100-continue`, a body-wait retry, and dispatch.
    HeadersProcessed,
    /// `parse()` reported the body isn't fully buffered yet; more bytes are needed.
    BodyUnready,
    /// The whole request (headers + body) is parsed and ready for the handler.
    BodyReceived,
    /// Writing the `100 Continue` interim response before the client sends its body.
    ContinueSending,
    /// Running the user handler to produce a `Response`.
    HandlerRunning,
    /// Writing the response's header/fixed-body buffer to the socket.
    ResponseWriting,
    /// Draining a registered `DynContentReader` one chunk frame at a time.
    ResponseBodyChunked,
    /// The content reader reported `Suspend`; yielding back to the scheduler before retrying.
    ResponseSuspended,
    /// Request/response cycle complete; deciding whether to loop or close.
    KeepAliveReset,
    /// Connection limits (request count or lifetime) are exhausted.
    Expired,
    /// The daemon's shutdown signal fired between requests.
    DaemonShutdown,
    /// Terminal: the loop is about to return.
    Closed(TerminationReason),
}

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    connection: Connection,
    pub(crate) parser: Parser,
    pub(crate) request: Request,
    pub(crate) response: Response,

    /// Set once per request from the `Transfer-Encoding`/`Expect` headers (§4.4 `HeadersProcessed`).
    pub(crate) chunked: bool,
    pub(crate) expect_continue: bool,

    /// Taken out of `response` while the connection loop drives it one chunk at a time, since
    /// `Response` has no socket access of its own.
    pending_reader: Option<Box<dyn DynContentReader>>,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,

    on_completed: Option<Arc<dyn NotifyCompleted>>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(
        handler: Arc<H>,
        limits: AllLimits,
        on_completed: Option<Arc<dyn NotifyCompleted>>,
    ) -> Self {
        Self {
            handler,
            connection_data: S::new(),

            connection: Connection::new(),
            parser: Parser::new(&limits.2),
            request: Request::new(&limits.2),
            response: Response::new(&limits.3),

            chunked: false,
            expect_continue: false,
            pending_reader: None,

            server_limits: limits.0,
            conn_limits: limits.1,
            req_limits: limits.2,
            resp_limits: limits.3,

            on_completed,
            shutdown_rx: None,
        }
    }

    /// Attaches the daemon's shutdown signal so keep-alive connections notice a stop request
    /// between requests instead of only at accept time.
    #[inline]
    pub(crate) fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    #[inline]
    fn notify_completed(&self, reason: TerminationReason) {
        if let Some(callback) = &self.on_completed {
            callback.notify(reason);
        }
    }

    #[inline]
    fn reset_request_response(&mut self) {
        self.parser.reset();
        self.request.reset();
        self.response.reset(&self.resp_limits);
        self.chunked = false;
        self.expect_continue = false;
        self.pending_reader = None;
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) async fn run<IO: AsyncStream>(
        &mut self,
        stream: &mut IO,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        session_info: Option<crate::server::tls::SessionInfo>,
    ) -> Result<(), io::Error> {
        self.request.set_addrs(client_addr, server_addr);
        self.request.set_session_info(session_info);

        match self.impl_run(stream).await {
            Ok(reason) => {
                log::trace!("connection to {client_addr} closed: {reason:?}");
                self.notify_completed(reason);
                Ok(())
            }
            Err(ErrorKind::Io(e)) => {
                self.notify_completed(TerminationReason::ClientAbort);
                Err(e.0)
            }
            Err(error) => {
                let result = self
                    .conn_limits
                    .send_error(
                        stream,
                        error,
                        self.request.version(),
                        self.server_limits.json_errors,
                    )
                    .await;
                self.notify_completed(TerminationReason::WithError);
                result
            }
        }
    }

    /// Drives a single accepted TCP connection through as many keep-alive requests as its
    /// limits allow, returning why the loop stopped (§4.4 `Closed(Termination)`).
    #[inline]
    pub(crate) async fn impl_run<IO: AsyncStream>(
        &mut self,
        stream: &mut IO,
    ) -> Result<TerminationReason, ErrorKind> {
        self.connection.reset();
        self.connection_data.reset();

        let mut state = ConnectionState::Init;

        loop {
            state = match state {
                ConnectionState::Init => {
                    if self.is_expired()? {
                        ConnectionState::Expired
                    } else if matches!(&self.shutdown_rx, Some(rx) if *rx.borrow()) {
                        ConnectionState::DaemonShutdown
                    } else {
                        self.reset_request_response();
                        ConnectionState::HeaderPartReceived
                    }
                }

                ConnectionState::HeaderPartReceived => {
                    if self.parser.headers_complete() {
                        ConnectionState::HeadersReceived
                    } else if self.parser.at_capacity() {
                        return Err(ErrorKind::TooManyHeaders);
                    } else if self
                        .parser
                        .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                        .await?
                        == 0
                    {
                        ConnectionState::Closed(TerminationReason::ClientAbort)
                    } else {
                        ConnectionState::HeaderPartReceived
                    }
                }

                ConnectionState::HeadersReceived => match self.parse() {
                    Ok(version) => {
                        self.response.version = version;
                        ConnectionState::HeadersProcessed
                    }
                    Err(ErrorKind::BodyMismatch { expected, available })
                        if available < expected =>
                    {
                        ConnectionState::BodyUnready
                    }
                    Err(e) => return Err(e),
                },

                ConnectionState::BodyUnready => {
                    if self.parser.at_capacity() {
                        return Err(ErrorKind::BodyTooLarge);
                    }
                    if self
                        .parser
                        .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                        .await?
                        == 0
                    {
                        ConnectionState::Closed(TerminationReason::ClientAbort)
                    } else {
                        self.parser.rewind();
                        self.request.reset();
                        ConnectionState::HeadersReceived
                    }
                }

                ConnectionState::HeadersProcessed => {
                    if self.expect_continue {
                        ConnectionState::ContinueSending
                    } else {
                        ConnectionState::BodyReceived
                    }
                }

                ConnectionState::ContinueSending => {
                    self.conn_limits
                        .write_bytes(
                            stream,
                            match self.response.version {
                                Version::Http11 => b"HTTP/1.1 100 Continue\r\n\r\n",
                                Version::Http10 => b"HTTP/1.0 100 Continue\r\n\r\n",
                            },
                        )
                        .await?;
                    ConnectionState::BodyReceived
                }

                ConnectionState::BodyReceived => ConnectionState::HandlerRunning,

                ConnectionState::HandlerRunning => {
                    self.handler
                        .handle(&mut self.connection_data, &self.request, &mut self.response)
                        .await;
                    ConnectionState::ResponseWriting
                }

                ConnectionState::ResponseWriting => {
                    self.conn_limits
                        .write_bytes(stream, self.response.buffer())
                        .await?;

                    self.pending_reader = self.response.take_pending_reader();
                    if self.pending_reader.is_some() {
                        ConnectionState::ResponseBodyChunked
                    } else {
                        ConnectionState::KeepAliveReset
                    }
                }

                ConnectionState::ResponseBodyChunked => {
                    self.write_next_chunk(stream).await?
                }

                ConnectionState::ResponseSuspended => {
                    tokio::task::yield_now().await;
                    ConnectionState::ResponseBodyChunked
                }

                ConnectionState::KeepAliveReset => {
                    self.connection.request_count += 1;
                    if !self.response.keep_alive {
                        ConnectionState::Closed(TerminationReason::CompletedOk)
                    } else {
                        ConnectionState::Init
                    }
                }

                ConnectionState::Expired => ConnectionState::Closed(TerminationReason::Timeout),
                ConnectionState::DaemonShutdown => {
                    ConnectionState::Closed(TerminationReason::DaemonShutdown)
                }

                ConnectionState::Closed(reason) => return Ok(reason),
            };
        }
    }

    /// Pulls one step out of the response's pending content reader and writes it to the socket
    /// as a chunk frame, returning the state to resume into on the next loop iteration.
    ///
    /// The reader itself is held outside `self.response` for the duration of the call (taken via
    /// `take_pending_reader` and put back unless it finished), since `Response` has no socket
    /// access and driving chunk writes here is what turns `Suspend` into a real scheduler yield
    /// instead of a busy-loop inside the reader.
    async fn write_next_chunk<IO: AsyncStream>(
        &mut self,
        stream: &mut IO,
    ) -> Result<ConnectionState, ErrorKind> {
        let Some(mut reader) = self.pending_reader.take() else {
            return Ok(ConnectionState::KeepAliveReset);
        };

        let mut chunk = [0u8; 8192];
        let outcome = reader.poll_read(&mut chunk).await;

        match outcome {
            ReadOutcome::Data(n) => {
                self.pending_reader = Some(reader);
                self.write_chunk_frame(stream, &chunk[..n]).await?;
                Ok(ConnectionState::ResponseBodyChunked)
            }
            ReadOutcome::EndOfStream => {
                self.write_final_chunk(stream).await?;
                Ok(ConnectionState::KeepAliveReset)
            }
            ReadOutcome::Suspend => {
                self.pending_reader = Some(reader);
                Ok(ConnectionState::ResponseSuspended)
            }
        }
    }

    async fn write_chunk_frame<IO: AsyncStream>(
        &self,
        stream: &mut IO,
        data: &[u8],
    ) -> Result<(), io::Error> {
        if data.is_empty() {
            return Ok(());
        }

        let mut frame = Vec::with_capacity(data.len() + 16);
        write_hex(&mut frame, data.len());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");

        self.conn_limits.write_bytes(stream, &frame).await
    }

    async fn write_final_chunk<IO: AsyncStream>(&self, stream: &mut IO) -> Result<(), io::Error> {
        self.conn_limits.write_bytes(stream, b"0\r\n\r\n").await
    }
}

/// Formats `n` as lowercase hex with no leading zeros, as required for a chunk-size line.
fn write_hex(out: &mut Vec<u8>, mut n: usize) {
    if n == 0 {
        out.push(b'0');
        return;
    }

    let start = out.len();
    while n > 0 {
        let digit = (n & 0xf) as u8;
        out.push(if digit < 10 {
            b'0' + digit
        } else {
            b'a' + (digit - 10)
        });
        n >>= 4;
    }
    out[start..].reverse();
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error<IO: AsyncStream>(
        &self,
        stream: &mut IO,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors))
            .await
    }

    #[inline]
    pub(crate) async fn write_bytes<IO: AsyncStream>(
        &self,
        stream: &mut IO,
        response: &[u8],
    ) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> Result<bool, ErrorKind> {
        Ok(!self.response.keep_alive
            || self.connection.request_count >= self.conn_limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime)
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use embedded_httpd::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
///
/// Check out a [real-world example
/// ](https://github.com/AmakeSashaDev/embedded_httpd/blob/main/examples/request_counter.rs)
/// (well, almost)
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use embedded_httpd::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// File-based IP blacklist:
/// ```
/// use std::net::SocketAddr;
/// use embedded_httpd::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     db: DatabaseClient
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
///         Ok(())
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// Two-stage filtering with cache:
/// ```
/// use std::{collections::HashSet, sync::RwLock, net::{SocketAddr, IpAddr}};
/// use embedded_httpd::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     cache: RwLock<HashSet<IpAddr>>,
///     db: DatabaseClient,
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         let Ok(guard) = self.cache.read() else {
///             return Err(err_resp.status(StatusCode::InternalServerError)
///                 .body("Internal server error"));
///         };
///
///         if guard.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             let Ok(mut guard) = self.cache.write() else {
///                 return Err(err_resp.status(StatusCode::InternalServerError)
///                     .body("Internal server error"));
///             };
///             guard.insert(client_addr.ip());
///
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    ///
    /// Use for:
    /// - IP blacklist/whitelist (in-memory cache)
    /// - Geographic IP restrictions
    /// - Rate limiting counters
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection.
    ///
    /// Called after [`filter`](Self::filter) succeeds.Executes asynchronously within
    /// the Tokio runtime.
    ///
    /// Use for:
    /// - Database lookups
    /// - External API calls
    /// - File system operations
    /// - Complex business logic
    /// - Machine learning inference
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

//

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                connection_data: (),

                connection: Connection::new(),
                parser: Parser::from(&req_limits, value),
                request: Request::new(&req_limits),
                response: Response::new(&resp_limits),

                chunked: false,
                expect_continue: false,
                pending_reader: None,

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                req_limits,
                resp_limits,

                on_completed: None,
                shutdown_rx: None,
            }
        }
    }
}
