//! webserv - readiness-driven HTTP/1.1 server with location routing and CGI
//!
//! A single-threaded server in the nginx mould: a TOML file describes
//! locations (URI prefix -> filesystem root + policy), requests are parsed
//! incrementally as bytes arrive, and CGI programs run as child processes
//! whose output is polled next to the client sockets.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining of bodyless requests,
//!   `Transfer-Encoding: chunked` request bodies, `Expect: 100-continue`
//! - **HTTP/1.0**: closes after each response unless `Connection: keep-alive`
//!
//! # Request pipeline
//!
//! 1. [`Connection`] accumulates socket reads and drives the
//!    [`ConnState`] machine: head parsing, then body framing.
//! 2. Once the head is known the request is routed with
//!    [`find_best_match`]; exact-match redirects, disallowed methods and
//!    declared bodies above the ceiling are answered before the body is read.
//! 3. A complete request is mapped onto the filesystem through
//!    [`resolve_path`], which rejects traversal outside the location root.
//! 4. Static files and directory listings are answered directly; scripts
//!    with a configured extension become a [`CgiJob`].
//!
//! # Examples
//!
//! ```no_run
//! use webserv::{Server, Site};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let site = Site::from_toml(r#"
//!         listen = "127.0.0.1:8080"
//!         root_prefix = "./www"
//!
//!         [[location]]
//!         path = "/"
//!         root = "/html"
//!         index = "index.html"
//!     "#).unwrap();
//!
//!     Server::builder()
//!         .listener(webserv::bind(site.listen, 1024).unwrap())
//!         .site(site)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod chunked;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod cgi;
    pub(crate) mod connection;
    pub(crate) mod dispatch;
    pub(crate) mod files;
    pub(crate) mod server_impl;
}
pub(crate) mod config;
pub(crate) mod errors;
pub mod limits;
pub(crate) mod routing;

pub use crate::{
    config::Site,
    errors::{ConfigError, ErrorKind},
    http::{
        chunked::Step,
        request::{parse_head, ClientRequest},
        response::Response,
        types::{HeaderMap, Method, StatusCode, Version},
    },
    routing::{find_best_match, resolve_path, Location, Redirect, ResolvedPath, RouteMatch},
    server::{
        cgi::CgiJob,
        connection::{ConnState, Connection, Framing},
        dispatch::{dispatch, Outcome},
        files::content_type,
        server_impl::{bind, Server, ServerBuilder},
    },
};
