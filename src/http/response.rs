//! HTTP response builder and wire serializer.

use crate::http::types::StatusCode;
use std::{borrow::Cow, fmt::Display};

/// HTTP response staged on a connection.
///
/// Built by chaining methods: [`status()`](Response::status) -> headers ->
/// [`body()`](Response::body). The `connection` and `content-length`
/// headers are computed during serialization and must not be added by hand.
///
/// # Examples
/// ```
/// use webserv::{Response, StatusCode};
///
/// let bytes = Response::status(StatusCode::Ok)
///     .header("content-type", "text/plain")
///     .body("Hello")
///     .into_bytes();
///
/// assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
/// assert!(bytes.ends_with(b"content-length: 5\r\n\r\nHello"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    kind: ResponseKind,
    keep_alive: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum ResponseKind {
    Built {
        status: StatusCode,
        headers: Vec<(Cow<'static, str>, String)>,
        body: Vec<u8>,
        omit_body: bool,
    },
    // Bytes produced elsewhere (a CGI program) and sent verbatim
    Raw(Vec<u8>),
}

impl Response {
    /// Starts a response with the given status code.
    #[inline]
    pub fn status(status: StatusCode) -> Self {
        Self {
            kind: ResponseKind::Built {
                status,
                headers: Vec::new(),
                body: Vec::new(),
                omit_body: false,
            },
            keep_alive: true,
        }
    }

    /// Interim `100 Continue` response.
    #[inline]
    pub fn continue_() -> Self {
        Self::status(StatusCode::Continue)
    }

    /// Redirect to `target` with the given 3xx status.
    #[inline]
    pub fn redirect(status: StatusCode, target: &str) -> Self {
        Self::status(status).header("location", target).body("")
    }

    /// Wraps a complete, already serialized HTTP message.
    ///
    /// The message is sent verbatim and the connection closes afterwards,
    /// since its framing is not under the server's control.
    #[inline]
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            kind: ResponseKind::Raw(bytes),
            keep_alive: false,
        }
    }

    /// Adds a header.
    #[inline]
    pub fn header(mut self, name: impl Into<Cow<'static, str>>, value: impl Display) -> Self {
        if let ResponseKind::Built { headers, .. } = &mut self.kind {
            headers.push((name.into(), value.to_string()));
        }
        self
    }

    /// Sets the body.
    #[inline]
    pub fn body(mut self, value: impl AsRef<[u8]>) -> Self {
        if let ResponseKind::Built { body, .. } = &mut self.kind {
            body.clear();
            body.extend_from_slice(value.as_ref());
        }
        self
    }

    /// Keeps `content-length` but drops the body bytes (answers to `HEAD`).
    #[inline]
    pub fn without_body(mut self) -> Self {
        if let ResponseKind::Built { omit_body, .. } = &mut self.kind {
            *omit_body = true;
        }
        self
    }

    /// Forces the connection to close after this response.
    #[inline]
    pub fn close(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    #[inline]
    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = self.keep_alive && keep_alive;
    }

    /// Whether the connection may stay open after this response.
    #[inline]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Status code, `None` for verbatim responses.
    #[inline]
    pub fn status_code(&self) -> Option<StatusCode> {
        match &self.kind {
            ResponseKind::Built { status, .. } => Some(*status),
            ResponseKind::Raw(_) => None,
        }
    }

    /// Header value by case-insensitive name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        match &self.kind {
            ResponseKind::Built { headers, .. } => headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            ResponseKind::Raw(_) => None,
        }
    }

    /// Body bytes, or the whole message for verbatim responses.
    pub fn body_bytes(&self) -> &[u8] {
        match &self.kind {
            ResponseKind::Built { body, .. } => body,
            ResponseKind::Raw(bytes) => bytes,
        }
    }

    /// Serializes the response into wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        let (status, headers, body, omit_body) = match self.kind {
            ResponseKind::Raw(bytes) => return bytes,
            ResponseKind::Built {
                status,
                headers,
                body,
                omit_body,
            } => (status, headers, body, omit_body),
        };

        let mut buffer = Vec::with_capacity(128 + body.len());
        buffer.extend_from_slice(status.first_line());

        for (name, value) in &headers {
            buffer.extend_from_slice(name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        // Interim responses carry no framing headers
        if status.is_informational() {
            buffer.extend_from_slice(b"\r\n");
            return buffer;
        }

        buffer.extend_from_slice(match self.keep_alive {
            true => b"connection: keep-alive\r\n",
            false => b"connection: close\r\n",
        });
        buffer.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());

        if !omit_body {
            buffer.extend_from_slice(&body);
        }

        buffer
    }
}
