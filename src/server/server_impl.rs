use crate::{
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, Response},
    },
    limits::{ConnLimits, PerIpLimits, ReqLimits, RespLimits, ServerLimits, TlsLimits, WaitStrategy},
    server::{
        connection::{ConnectionData, HttpConnection},
        tls::{self, Transport},
    },
    termination::NotifyCompleted,
    ConnectionFilter, Version,
};
use crossbeam::queue::SegQueue;
use std::{
    collections::HashMap,
    future::Future,
    marker::{PhantomData, Send, Sync},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex as StdMutex},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{yield_now, JoinHandle},
    time::sleep as tokio_sleep,
};
use tokio_rustls::TlsAcceptor;

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. database connection pool, router configuration)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use embedded_httpd::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
///         // Simple echo handler
///         if req.url().target() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// Handler with [`ConnectionData`]
/// ```
/// use embedded_httpd::{Handler, ConnectionData, Request, Response, Handled, StatusCode};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(&self, data: &mut State, req: &Request, resp: &mut Response) -> Handled {
///         data.request_count += 1;
///
///         resp.status(StatusCode::Ok)
///             .body(format!("Request #{}", data.request_count))
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///     
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// # Parameters
    ///
    /// - `connection_data`: Mutable reference to connection-specific state
    /// - `req`: Immutable reference to the parsed HTTP request
    /// - `resp`: Mutable response builder for constructing the response
    ///
    /// # Returns
    ///
    /// `Handled` indicating whether the request was fully processed or
    /// requires further handling by other middleware.
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics will terminate the connection.
    fn handle(
        &self,
        connection_data: &mut S,
        request: &Request,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;
}

/// An HTTP server that processes incoming connections and requests.
///
/// The server uses a pre-allocated connection pool for maximum performance
/// and implements graceful connection handling with configurable limits.
///
/// # Examples
///
/// ```no_run
/// use embedded_httpd::{Server, Handler, Request, Response, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
    per_ip: Option<Arc<PerIpState>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use embedded_httpd::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder<H, S>() -> ServerBuilder<H, S, ()>
    where
        H: Handler<S>,
        S: ConnectionData,
    {
        ServerBuilder {
            listener: None,
            handler: None,
            connection_filter: Arc::new(()),
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            tls_limits: None,
            per_ip_limits: None,
            concurrency_policy: ConcurrencyPolicy::InternalSelect,
            on_completed: None,
        }
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// Returns once [`shutdown()`](Self::shutdown) has been called on a handle to this same
    /// server (e.g. from another task sharing an `Arc<Server>`).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embedded_httpd::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    #[inline]
    pub async fn launch(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = self.step() => {}
            }
        }
    }

    /// Accepts and admits (or rejects) a single pending connection, then returns.
    ///
    /// Exposed for [`ConcurrencyPolicy::ExternalSelect`]: instead of calling
    /// [`launch()`](Self::launch) (which loops forever), the host can drive its own event loop
    /// and `.await` this once per iteration.
    #[inline]
    pub async fn step(&self) {
        let Ok((stream, addr)) = self.listener.accept().await else {
            return;
        };

        if let Some(per_ip) = &self.per_ip {
            if !per_ip.try_acquire(addr.ip()) {
                self.error_queue.push((stream, addr));
                return;
            }
        }

        match self.stream_queue.len() < self.server_limits.max_pending_connections {
            true => self.stream_queue.push((stream, addr)),
            false => self.error_queue.push((stream, addr)),
        }
    }

    /// Signals every worker to stop accepting new connections and awaits each worker task to
    /// completion. A connection that is idle between keep-alive requests notices the signal and
    /// closes with [`TerminationReason::DaemonShutdown`](crate::TerminationReason); a connection
    /// mid-request is left to finish that request normally before its worker exits.
    ///
    /// Requires a shared handle obtained before [`launch()`](Self::launch) is called on another
    /// task, typically by wrapping the built [`Server`] in an `Arc`.
    #[inline]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// # Protocol Support
///
/// - `HTTP/1.X` (HTTP/1.1 or HTTP/1.0): Always enabled
/// - TLS: Optional, enabled by setting [`tls_limits`](Self::tls_limits)
pub struct ServerBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    connection_filter: Arc<F>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    tls_limits: Option<TlsLimits>,
    per_ip_limits: Option<PerIpLimits>,
    concurrency_policy: ConcurrencyPolicy,
    on_completed: Option<Arc<dyn NotifyCompleted>>,
}

impl<H, S, F> ServerBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use embedded_httpd::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use embedded_httpd::{Server, Handler, Request, Response, Handled, StatusCode};
    /// use tokio::net::TcpListener;
    ///
    /// struct MyStruct;
    ///
    /// impl Handler for MyStruct {
    ///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
    ///         resp.status(StatusCode::Ok).body("Hello World!")
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a connection filter to check incoming TCP connections
    /// before using it.
    ///
    /// Allows early rejection of unwanted IP addresses (before the
    /// first read). Can be used for DDoS protection, geobanning, etc.
    ///
    /// For more information, see [ConnectionFilter](crate::ConnectionFilter)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// use tokio::net::TcpListener;
    /// use std::net::SocketAddr;
    /// use embedded_httpd::{ConnectionFilter, Server};
    ///
    /// struct MyConnFilter {
    ///     blacklist: Vec<SocketAddr>
    /// }
    ///
    /// impl ConnectionFilter for MyConnFilter {
    ///     fn filter(
    ///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
    ///     ) -> Result<(), Handled> {
    ///         if self.blacklist.contains(&client_addr) {
    ///             Err(err_resp
    ///                 .status(StatusCode::Forbidden)
    ///                 .body(b"Your IP is permanently banned"))
    ///         } else {
    ///             Ok(())
    ///         }
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let filter = MyConnFilter {
    ///     blacklist: vec![
    ///         "192.0.2.1".parse().unwrap(),
    ///         "198.51.100.1".parse().unwrap(),
    ///         "203.0.113.1".parse().unwrap(),
    ///         "10.0.0.1".parse().unwrap(),
    ///     ]
    /// };
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .conn_filter(filter)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn conn_filter<NewF>(self, filter: NewF) -> ServerBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            connection_filter: Arc::new(filter),
            _marker: self._marker,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
            tls_limits: self.tls_limits,
            per_ip_limits: self.per_ip_limits,
            concurrency_policy: self.concurrency_policy,
            on_completed: self.on_completed,
        }
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embedded_httpd::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embedded_httpd::{Server, limits::ConnLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         socket_read_timeout: Duration::from_secs(5),
    ///         socket_write_timeout: Duration::from_secs(2),
    ///         connection_lifetime: Duration::from_secs(200),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Enables TLS termination using the given key/certificate material.
    ///
    /// # Note
    ///
    /// Omitting this call builds a plaintext server. [`Request::session_info`
    /// ](crate::Request::session_info) is `None` on every request served over a plaintext
    /// connection.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embedded_httpd::{Server, limits::TlsLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8443").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .tls_limits(TlsLimits {
    ///         key_pem: std::fs::read("key.pem").unwrap(),
    ///         cert_pem: std::fs::read("cert.pem").unwrap(),
    ///         ..TlsLimits::default()
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn tls_limits(mut self, limits: TlsLimits) -> Self {
        self.tls_limits = Some(limits);
        self
    }

    /// Caps the number of concurrent connections accepted from a single client IP.
    #[inline(always)]
    pub fn per_ip_limits(mut self, limits: PerIpLimits) -> Self {
        self.per_ip_limits = Some(limits);
        self
    }

    /// Selects how the server drives connection acceptance and dispatch.
    /// Defaults to [`ConcurrencyPolicy::InternalSelect`].
    #[inline(always)]
    pub fn concurrency_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency_policy = policy;
        self
    }

    /// Registers a callback invoked exactly once per connection when it closes, with the reason
    /// it closed. See [`NotifyCompleted`](crate::NotifyCompleted).
    #[inline(always)]
    pub fn on_completed<N: NotifyCompleted>(mut self, notify: N) -> Self {
        self.on_completed = Some(Arc::new(notify));
        self
    }

    /// Applies a batch of [`DaemonOption`]s in order, as an alternative to chaining the
    /// individual setter methods.
    #[inline]
    pub fn options(mut self, options: impl IntoIterator<Item = DaemonOption>) -> Self {
        for option in options {
            self = match option {
                DaemonOption::Server(limits) => self.server_limits(limits),
                DaemonOption::Connection(limits) => self.connection_limits(limits),
                DaemonOption::Request(limits) => self.request_limits(limits),
                DaemonOption::Response(limits) => self.response_limits(limits),
                DaemonOption::Tls(limits) => self.tls_limits(limits),
                DaemonOption::PerIp(limits) => self.per_ip_limits(limits),
                DaemonOption::Concurrency(policy) => self.concurrency_policy(policy),
            };
        }
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embedded_httpd::{Server, limits::ReqLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .request_limits(ReqLimits {
    ///         // Your changes
    ///         url_size: 1024,
    ///         url_query_parts: 32,
    ///         url_parts: 20,
    ///         ..ReqLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use embedded_httpd::{Server, limits::RespLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .response_limits(RespLimits {
    ///         // Your changes
    ///         default_capacity: 1024,
    ///         max_capacity: 4096,
    ///         ..RespLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` method must be called to create``
    /// - ``The `handler` method must be called to create``
    ///
    /// Panics when:
    /// - The `listener` method was not called.
    /// - The `handler` method was not called.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # embedded_httpd::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use embedded_httpd::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    ///
    /// // Yes, 3 identical examples, for you, in case you suddenly get lost :)
    /// #
    /// # // No, really. Documentation can be difficult for beginners.
    /// # }
    /// ```
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let tls_acceptor = self
            .tls_limits
            .as_ref()
            .map(|limits| Arc::new(tls::build_acceptor(limits).expect("invalid TLS key/cert material")));
        let per_ip = self.per_ip_limits.as_ref().map(|limits| {
            Arc::new(PerIpState::new(limits.max_per_ip))
        });
        let concurrency_policy = self.concurrency_policy;
        let on_completed = self.on_completed.clone();

        let (listener, handler, filter, limits) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();

        match concurrency_policy {
            ConcurrencyPolicy::ThreadPerConnection => {
                tasks.push(Self::spawn_dispatcher(
                    &stream_queue,
                    &limits,
                    &filter,
                    &handler,
                    &tls_acceptor,
                    &per_ip,
                    &on_completed,
                    &shutdown_rx,
                ));
            }
            ConcurrencyPolicy::InternalSelect | ConcurrencyPolicy::ExternalSelect => {
                for _ in 0..limits.0.max_connections {
                    tasks.push(Self::spawn_worker(
                        &stream_queue,
                        &limits,
                        &filter,
                        &handler,
                        &tls_acceptor,
                        &per_ip,
                        &on_completed,
                        &shutdown_rx,
                    ));
                }
            }
        }

        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &limits);
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &limits);
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: limits.0,
            per_ip,
            shutdown_tx,
            shutdown_rx,
            tasks: StdMutex::new(tasks),
        }
    }

    #[inline]
    async fn serve_one(
        stream: TcpStream,
        addr: SocketAddr,
        conn: &mut HttpConnection<H, S>,
        filter: &Arc<F>,
        tls_acceptor: &Option<Arc<TlsAcceptor>>,
        per_ip: &Option<Arc<PerIpState>>,
    ) {
        let mut stream = stream;

        let Ok(local_addr) = stream.local_addr() else {
            return;
        };

        if filter.filter(addr, local_addr, &mut conn.response).is_err()
            || filter
                .filter_async(addr, local_addr, &mut conn.response)
                .await
                .is_err()
        {
            let _ = conn
                .conn_limits
                .write_bytes(&mut stream, conn.response.buffer())
                .await;

            conn.response.reset(&conn.resp_limits);
            return;
        }

        let mut transport = match tls_acceptor {
            Some(acceptor) => match tls::accept(acceptor, stream).await {
                Ok(transport) => transport,
                Err(error) => {
                    log::debug!("TLS handshake with {addr} failed: {error}");
                    return;
                }
            },
            None => Transport::Plain(stream),
        };
        let session_info = transport.session_info();

        let _ = conn.run(&mut transport, addr, local_addr, session_info).await;

        if let Some(per_ip) = per_ip {
            per_ip.release(addr.ip());
        }
    }

    /// Races waiting for the next queued stream against the shutdown signal. `Ok` carries the
    /// stream to serve; `Err` means shutdown fired first and the caller should stop looping.
    #[inline]
    async fn get_stream_or_shutdown(
        queue: &TcpQueue,
        wait: &WaitStrategy,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(TcpStream, SocketAddr), ()> {
        if *shutdown_rx.borrow() {
            return Err(());
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => Err(()),
                    _ => Ok(Server::get_stream(queue, wait).await),
                }
            }
            stream = Server::get_stream(queue, wait) => Ok(stream),
        }
    }

    #[inline]
    fn spawn_worker(
        queue: &TcpQueue,
        limits: &AllLimits,
        filter: &Arc<F>,
        handler: &Arc<H>,
        tls_acceptor: &Option<Arc<TlsAcceptor>>,
        per_ip: &Option<Arc<PerIpState>>,
        on_completed: &Option<Arc<dyn NotifyCompleted>>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = queue.clone();
        let filter = filter.clone();
        let tls_acceptor = tls_acceptor.clone();
        let per_ip = per_ip.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let mut conn = HttpConnection::new(handler.clone(), limits.clone(), on_completed.clone())
            .with_shutdown(shutdown_rx.clone());

        tokio::spawn(async move {
            loop {
                let wait_strategy = conn.server_limits.wait_strategy.clone();
                let Ok((stream, addr)) =
                    Self::get_stream_or_shutdown(&queue, &wait_strategy, &mut shutdown_rx).await
                else {
                    return;
                };

                Self::serve_one(stream, addr, &mut conn, &filter, &tls_acceptor, &per_ip).await;
            }
        })
    }

    /// [`ConcurrencyPolicy::ThreadPerConnection`]: spawns a brand new task (with its own
    /// [`HttpConnection`]) per accepted connection instead of reusing a fixed worker pool.
    #[inline]
    fn spawn_dispatcher(
        queue: &TcpQueue,
        limits: &AllLimits,
        filter: &Arc<F>,
        handler: &Arc<H>,
        tls_acceptor: &Option<Arc<TlsAcceptor>>,
        per_ip: &Option<Arc<PerIpState>>,
        on_completed: &Option<Arc<dyn NotifyCompleted>>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = queue.clone();
        let filter = filter.clone();
        let handler = handler.clone();
        let limits = limits.clone();
        let tls_acceptor = tls_acceptor.clone();
        let per_ip = per_ip.clone();
        let on_completed = on_completed.clone();
        let wait_strategy = limits.0.wait_strategy.clone();
        let mut shutdown_rx = shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, addr)) =
                    Self::get_stream_or_shutdown(&queue, &wait_strategy, &mut shutdown_rx).await
                else {
                    return;
                };

                let filter = filter.clone();
                let tls_acceptor = tls_acceptor.clone();
                let per_ip = per_ip.clone();
                let mut conn = HttpConnection::new(handler.clone(), limits.clone(), on_completed.clone())
                    .with_shutdown(shutdown_rx.clone());

                tokio::spawn(async move {
                    Self::serve_one(stream, addr, &mut conn, &filter, &tls_acceptor, &per_ip).await;
                });
            }
        })
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, limits: &AllLimits) {
        let queue = queue.clone();
        let (server_limits, conn_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) =
                    Server::get_stream(&queue, &server_limits.wait_strategy).await;

                let _ = conn_limits
                    .send_error(
                        &mut stream,
                        ErrorKind::ServiceUnavailable,
                        Version::Http11,
                        server_limits.json_errors,
                    )
                    .await;
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, limits: &AllLimits) {
        let queue = queue.clone();
        let (server_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = Server::get_stream(&queue, &server_limits.wait_strategy).await;

                drop(stream);
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<H>, Arc<F>, AllLimits) {
        (
            self.listener
                .expect("The `listener` method must be called to create"),
            self.handler
                .expect("The `handler` method must be called to create"),
            self.connection_filter,
            (
                self.server_limits.clone().unwrap_or_default(),
                self.connection_limits.clone().unwrap_or_default(),
                self.request_limits
                    .clone()
                    .unwrap_or_default()
                    .precalculate(),
                self.response_limits.clone().unwrap_or_default(),
            ),
        )
    }
}

/// How the server drives connection acceptance and request dispatch.
///
/// Maps the distillation's "internal select loop" / "external select loop" / "thread per
/// connection" daemon modes onto tokio idiom (see `Open Question decisions` in `DESIGN.md`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// A fixed pool of [`ServerLimits::max_connections`](crate::limits::ServerLimits) worker
    /// tasks pulls from the admission queue; [`Server::launch`] owns the accept loop.
    #[default]
    InternalSelect,
    /// Same worker pool as [`InternalSelect`](Self::InternalSelect), but the host calls
    /// [`Server::step`] itself instead of [`Server::launch`], driving accept scheduling from its
    /// own loop.
    ExternalSelect,
    /// A fresh task (and [`HttpConnection`]) is spawned per accepted connection instead of
    /// reusing a fixed pool. Trades the zero-allocation-after-startup design for unbounded
    /// concurrency.
    ThreadPerConnection,
}

/// Flat configuration option, for building a [`ServerBuilder`] from a list instead of chained
/// setter calls (mirrors a daemon-options array in the style of MHD's `MHD_OPTION`).
#[derive(Debug, Clone)]
pub enum DaemonOption {
    Server(ServerLimits),
    Connection(ConnLimits),
    Request(ReqLimits),
    Response(RespLimits),
    Tls(TlsLimits),
    PerIp(PerIpLimits),
    Concurrency(ConcurrencyPolicy),
}

/// Per-client-IP connection counter backing [`PerIpLimits`].
pub(crate) struct PerIpState {
    max_per_ip: usize,
    counts: std::sync::Mutex<HashMap<IpAddr, usize>>,
}

impl PerIpState {
    fn new(max_per_ip: usize) -> Self {
        Self {
            max_per_ip,
            counts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(ip).or_insert(0);

        if *count >= self.max_per_ip {
            return false;
        }

        *count += 1;
        true
    }

    fn release(&self, ip: IpAddr) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits);

#[cfg(test)]
mod per_ip_state_tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, n])
    }

    #[test]
    fn admits_up_to_the_limit_then_rejects() {
        let state = PerIpState::new(2);

        assert!(state.try_acquire(ip(1)));
        assert!(state.try_acquire(ip(1)));
        assert!(!state.try_acquire(ip(1)));
    }

    #[test]
    fn counters_are_independent_per_ip() {
        let state = PerIpState::new(1);

        assert!(state.try_acquire(ip(1)));
        assert!(state.try_acquire(ip(2)));
        assert!(!state.try_acquire(ip(1)));
        assert!(!state.try_acquire(ip(2)));
    }

    #[test]
    fn release_frees_a_slot_for_reuse() {
        let state = PerIpState::new(1);

        assert!(state.try_acquire(ip(1)));
        assert!(!state.try_acquire(ip(1)));

        state.release(ip(1));
        assert!(state.try_acquire(ip(1)));
    }

    #[test]
    fn release_on_an_untracked_ip_is_a_no_op() {
        let state = PerIpState::new(1);
        state.release(ip(9));
        assert!(state.try_acquire(ip(9)));
    }
}
