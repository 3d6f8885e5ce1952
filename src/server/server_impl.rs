use crate::{
    config::Site,
    errors::ErrorKind,
    limits::{ConnLimits, ReqLimits, ServerLimits},
    server::{
        cgi::CgiJob,
        connection::Connection,
        dispatch::{self, Outcome},
    },
};
use crossbeam::queue::ArrayQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{future, io, net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::{sleep_until, timeout, Instant},
};

/// Opens a non-blocking listening socket with `SO_REUSEADDR` set.
///
/// Must be called from inside a tokio runtime.
pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// The HTTP server: one accept loop feeding a fixed pool of connections.
///
/// # Examples
///
/// ```no_run
/// use webserv::{Server, Site};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let site = Site::load("webserv.toml").unwrap();
///     let listener = webserv::bind(site.listen, 1024).unwrap();
///
///     Server::builder()
///         .listener(listener)
///         .site(site)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    site: Arc<Site>,
    pool: Arc<ArrayQueue<Connection>>,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            site: None,
            server_limits: None,
            connection_limits: None,
            request_limits: None,
        }
    }

    /// Accepts connections forever.
    ///
    /// Every socket gets a pooled [`Connection`] and its own task. When the
    /// pool is empty the socket receives a `503` and is closed.
    pub async fn launch(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, locations = self.site.locations.len(), "listening");
        }

        let mut next_id = 0u64;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            next_id += 1;

            let Some(mut conn) = self.pool.pop() else {
                tracing::warn!(%peer, "connection pool exhausted");
                let limits = self.conn_limits.clone();
                let json = self.server_limits.json_errors;
                tokio::spawn(reject(stream, limits, json));
                continue;
            };

            conn.open(next_id);
            tracing::debug!(connection = next_id, %peer, "connection opened");

            let pool = Arc::clone(&self.pool);
            let site = Arc::clone(&self.site);
            let limits = self.conn_limits.clone();

            tokio::spawn(async move {
                let mut stream = stream;
                if let Err(e) = drive(&mut conn, &mut stream, &site, &limits).await {
                    tracing::debug!(connection = conn.id(), error = %e, "connection aborted");
                }
                tracing::debug!(
                    connection = conn.id(),
                    requests = conn.request_count(),
                    "connection closed"
                );

                let _ = pool.push(conn);
            });
        }
    }
}

async fn reject(mut stream: TcpStream, limits: ConnLimits, json: bool) {
    let bytes = ErrorKind::ServiceUnavailable.response(json).into_bytes();
    let _ = write(&mut stream, &bytes, &limits).await;
}

#[inline(always)]
async fn write(stream: &mut TcpStream, bytes: &[u8], limits: &ConnLimits) -> io::Result<()> {
    timeout(limits.socket_write_timeout, stream.write_all(bytes)).await?
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn cgi_output(job: &mut Option<CgiJob>) -> Result<bool, ErrorKind> {
    match job {
        Some(job) => job.on_readable().await,
        None => future::pending().await,
    }
}

/// Runs one client socket until it closes.
///
/// The socket and the CGI program of the in-flight request are waited on
/// together, so neither a slow client nor a slow program blocks the other.
async fn drive(
    conn: &mut Connection,
    stream: &mut TcpStream,
    site: &Site,
    limits: &ConnLimits,
) -> io::Result<()> {
    let mut buf = vec![0u8; limits.read_chunk_size.max(1)];
    let mut job: Option<CgiJob> = None;
    let mut peer_closed = false;

    loop {
        if let Some(interim) = conn.take_interim() {
            write(stream, &interim.into_bytes(), limits).await?;
        }

        if job.is_none() {
            if let Some(request) = conn.take_request() {
                match conn.route().cloned() {
                    Some(route) => match dispatch::dispatch(&request, &route, site).await {
                        Ok(Outcome::Respond(response)) => {
                            let _ = conn.stage_response(response);
                        }
                        Ok(Outcome::Cgi(started)) => job = Some(started),
                        Err(err) => conn.fail(err),
                    },
                    None => conn.fail(ErrorKind::NoRoute),
                }
            }
        }

        if let Some(mut response) = conn.take_response() {
            let last = conn.request_count() + 1 >= limits.max_requests_per_connection;
            if last {
                response = response.close();
            }
            let close = conn.should_close() || last;

            tracing::debug!(
                connection = conn.id(),
                status = response.status_code().map(|s| s.as_u16()),
                close,
                "sending response"
            );
            write(stream, &response.into_bytes(), limits).await?;

            if close {
                return Ok(());
            }
            conn.next_request();
            continue;
        }

        if peer_closed && job.is_none() {
            return Ok(());
        }

        let cgi_deadline = job
            .as_ref()
            .map(|job| Instant::from_std(job.started()) + limits.cgi_timeout);
        let idle_deadline = match job {
            Some(_) => None,
            None => Some(Instant::from_std(conn.last_activity()) + limits.socket_read_timeout),
        };

        tokio::select! {
            ready = stream.readable(), if !peer_closed && conn.wants_input() => {
                ready?;
                loop {
                    match stream.try_read(&mut buf) {
                        Ok(0) => {
                            peer_closed = true;
                            break;
                        }
                        Ok(n) => {
                            conn.on_readable(&buf[..n]);
                            if !conn.wants_input() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            output = cgi_output(&mut job) => {
                let Some(running) = job.take() else { continue };

                match output {
                    Ok(false) => job = Some(running),
                    Ok(true) => match running.finish(limits.cgi_timeout).await {
                        Ok(response) => {
                            let _ = conn.stage_response(response);
                        }
                        Err(err) => conn.fail(err),
                    },
                    Err(err) => conn.fail(running.abort(err).await),
                }
            }
            _ = until(cgi_deadline) => {
                if let Some(running) = job.take() {
                    tracing::error!(
                        connection = conn.id(),
                        pid = running.pid(),
                        "CGI program timed out"
                    );
                    conn.fail(running.abort(ErrorKind::CgiTimeout).await);
                }
            }
            _ = until(idle_deadline) => {
                tracing::debug!(connection = conn.id(), "idle timeout");
                return Ok(());
            }
        }
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    site: Option<Site>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
}

impl ServerBuilder {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.** See [`bind`].
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the routing table.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn site(mut self, site: Site) -> Self {
        self.site = Some(site);
        self
    }

    /// Configures admission and error format.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures timeouts and per-connection request limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Finalizes the builder and allocates the connection pool.
    ///
    /// # Panics
    ///
    /// Panics when:
    /// - The `listener` method was not called.
    /// - The `site` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let listener = self
            .listener
            .expect("The `listener` method must be called to create");
        let site = Arc::new(self.site.expect("The `site` method must be called to create"));

        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        let request_limits = self.request_limits.unwrap_or_default();

        let capacity = server_limits.max_connections.max(1);
        let pool = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let conn = Connection::new(
                Arc::clone(&site),
                request_limits.clone(),
                server_limits.json_errors,
            );
            let _ = pool.push(conn);
        }

        Server {
            listener,
            site,
            pool: Arc::new(pool),
            server_limits,
            conn_limits,
        }
    }
}
