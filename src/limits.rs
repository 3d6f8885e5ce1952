//! Server, connection and request limits
//!
//! # Security-First Defaults
//!
//! Default limits are conservative to prevent:
//! - Resource exhaustion
//! - Slowloris style idle connections
//! - Header flooding
//! - Runaway CGI programs
//!
//! Body size ceilings are not part of these limits: they come from the
//! configuration file (server level) and from each location (route level).
//!
//! # Examples
//!
//! ```no_run
//! use webserv::{Server, Site, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let site = Site::load("webserv.toml").unwrap();
//!
//!     Server::builder()
//!         .listener(webserv::bind("127.0.0.1:8080".parse().unwrap(), 1024).unwrap())
//!         .site(site)
//!         .server_limits(ServerLimits {
//!             max_connections: 512,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             cgi_timeout: Duration::from_secs(10),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 50,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level admission.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  \/
/// [-----------------]  Yes  /-----------------\  No   [-------------]
/// [ Take Connection ] <==== | Pool has a slot? | ====> [ Sending 503 ]
/// [-----------------]       \-----------------/        [-------------]
///        ||
///        \/
/// [-------------------]
/// [ Drive until close ] ==> Connection returned to the pool
/// [-------------------]
/// ```
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of connections served at the same time (default: `256`).
    ///
    /// Exactly this many connection objects are allocated at startup and
    /// reused. When all of them are busy, new sockets receive a
    /// [503](crate::StatusCode::ServiceUnavailable) and are closed.
    pub max_connections: usize,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// content-type: application/json\r
    /// connection: close\r
    /// content-length: 58\r
    /// \r
    /// {"error":"Missing Host header","code":"MISSING_HOST"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 256,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Per-connection limits and timeouts.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle time after which a connection is evicted (default: `30s`).
    ///
    /// Measured from the last byte received. A connection waiting on a CGI
    /// program is governed by [`cgi_timeout`](Self::cgi_timeout) instead.
    pub socket_read_timeout: Duration,

    /// Maximum time for writing one response (default: `10s`).
    pub socket_write_timeout: Duration,

    /// Maximum number of requests served on one connection (default: `100`).
    ///
    /// The last allowed response carries `connection: close`.
    pub max_requests_per_connection: usize,

    /// Bytes requested from the socket per read call (default: `8 KiB`).
    pub read_chunk_size: usize,

    /// Time a CGI program may run before it is killed and the client
    /// receives a [504](crate::StatusCode::GatewayTimeout) (default: `30s`).
    pub cgi_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(10),
            max_requests_per_connection: 100,
            read_chunk_size: 8 * 1024,
            cgi_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Limits applied while parsing a request head and chunked framing.
///
/// Exceeding any of them produces a canned error response and closes
/// the connection.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request-target length in bytes (default: `2048`), else `414`.
    pub uri_size: usize,

    /// Maximum number of header lines (default: `100`), else `400`.
    pub header_count: usize,
    /// Maximum header name length (default: `1024`), else `400`.
    pub header_name_size: usize,
    /// Maximum header value length (default: `8000`), else `400`.
    pub header_value_size: usize,

    /// Maximum size of the buffered head while its terminating blank line
    /// has not arrived (default: `64 KiB`), else `431`.
    pub header_block_size: usize,

    /// Maximum length of a chunk-size or trailer line (default: `1024`).
    pub chunk_line_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            uri_size: 2048,

            header_count: 100,
            header_name_size: 1024,
            header_value_size: 8000,

            header_block_size: 64 * 1024,
            chunk_line_size: 1024,

            _priv: (),
        }
    }
}
