use crate::{
    errors::ErrorKind,
    http::types::{self, Header, HeaderMap},
    limits::ReqLimits,
    Method, Version,
};
use memchr::memchr;

/// One parsed HTTP request.
///
/// Created from a complete request head by [`parse_head`]; the body is
/// attached by the connection once its framing has been fully consumed.
///
/// # Input data requirements
///
/// #### Character encoding
///
/// The head (request line and headers) must be valid `UTF-8`, otherwise the
/// request is rejected with `400`. The body is arbitrary bytes.
///
/// #### Request line
/// ```text
/// [METHOD] SP [TARGET] SP [VERSION] CRLF
/// ```
/// Exactly one space between tokens. `[TARGET]` starts with `/`, is at most
/// [`uri_size`](crate::limits::ReqLimits::uri_size) bytes long (else `414`)
/// and is split into path and query at the first `?`.
///
/// #### Headers
/// ```text
/// [NAME]:[OWS][VALUE][OWS] CRLF
/// ```
/// Names are ASCII alphanumerics, `-` and `_`, matched case-insensitively and
/// stored lowercased. Every name may appear at most once.
///
/// | Header              | Accepted value                  | Otherwise |
/// |---------------------|---------------------------------|-----------|
/// | `Transfer-Encoding` | `chunked` (any case)            | `400`     |
/// | `Content-Length`    | non-negative decimal integer    | `400`     |
/// | `Expect`            | `100-continue` (any case)       | `417`     |
/// | `Connection`        | `close` / `keep-alive` tokens   | ignored   |
///
/// `Host` is mandatory, and `Content-Length` together with chunked encoding
/// is rejected since the body framing would be ambiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,

    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) expect_continue: bool,
    pub(crate) keep_alive: bool,

    pub(crate) body: Vec<u8>,
    pub(crate) connection_id: u64,
}

// Public API
impl ClientRequest {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Raw request target, path and query included.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Target without the query string.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string without the leading `?`, empty when absent.
    #[inline(always)]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Header value by case-insensitive name.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Declared `Content-Length`, `None` when the header is absent.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    #[inline(always)]
    pub const fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Decoded body bytes, empty for bodyless requests.
    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline(always)]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

/// Parses a complete request head.
///
/// `head` runs from the first byte of the request line up to and including
/// the blank line that ends the header block. Either a fully populated
/// request is returned or the error that decides the response status.
pub fn parse_head(
    head: &[u8],
    limits: &ReqLimits,
    connection_id: u64,
) -> Result<ClientRequest, ErrorKind> {
    if simdutf8::basic::from_utf8(head).is_err() {
        return Err(ErrorKind::InvalidEncoding);
    }

    let mut lines = Lines { src: head };
    let first = lines.next().ok_or(ErrorKind::InvalidRequestLine)?;
    let mut request = parse_request_line(first, limits, connection_id)?;

    let mut terminated = false;
    for line in lines.by_ref() {
        if line.is_empty() {
            terminated = true;
            break;
        }

        if request.headers.len() == limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }
        request.parse_header(line, limits)?;
    }

    // The caller found the terminator before calling, so reaching the end
    // without a blank line means the head was cut short
    if !terminated {
        return Err(ErrorKind::InvalidHeader);
    }

    if !request.headers.contains("host") {
        return Err(ErrorKind::MissingHost);
    }
    if request.chunked && request.content_length.is_some() {
        return Err(ErrorKind::AmbiguousFraming);
    }

    Ok(request)
}

#[inline]
fn parse_request_line(
    line: &[u8],
    limits: &ReqLimits,
    connection_id: u64,
) -> Result<ClientRequest, ErrorKind> {
    let mut parts = line.split(|&b| b == b' ');

    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ErrorKind::InvalidRequestLine);
    };

    let method = Method::from_bytes(method)?;

    if target.len() > limits.uri_size {
        return Err(ErrorKind::UriTooLong);
    }
    if !target.starts_with(b"/") {
        return Err(ErrorKind::InvalidRequestLine);
    }

    let version = Version::from_bytes(version)?;

    // Head was validated as UTF-8 and the split points are ASCII
    let target = String::from_utf8_lossy(target).into_owned();
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), query.to_owned()),
        None => (target.clone(), String::new()),
    };

    Ok(ClientRequest {
        method,
        target,
        path,
        query,
        version,
        headers: HeaderMap::new(16),

        content_length: None,
        chunked: false,
        expect_continue: false,
        keep_alive: version.default_keep_alive(),

        body: Vec::new(),
        connection_id,
    })
}

// Parse headers
impl ClientRequest {
    #[inline]
    fn parse_header(&mut self, line: &[u8], limits: &ReqLimits) -> Result<(), ErrorKind> {
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let (name, value) = (&line[..colon], types::trim_ows(&line[colon + 1..]));

        if name.is_empty()
            || name.len() > limits.header_name_size
            || !name
                .iter()
                .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ErrorKind::InvalidHeader);
        }
        if value.len() > limits.header_value_size {
            return Err(ErrorKind::InvalidHeader);
        }

        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        if self.headers.contains(&name) {
            return Err(ErrorKind::DuplicateHeader);
        }

        match name.as_str() {
            "transfer-encoding" => match value.eq_ignore_ascii_case(b"chunked") {
                true => self.chunked = true,
                false => return Err(ErrorKind::InvalidTransferEncoding),
            },
            "content-length" => {
                let len = types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
                self.content_length = Some(len);
            }
            "expect" => match value.eq_ignore_ascii_case(b"100-continue") {
                true => self.expect_continue = true,
                false => return Err(ErrorKind::ExpectationFailed),
            },
            "connection" => self.parse_header_connection(value),
            _ => {}
        }

        self.headers.headers.push(Header {
            name,
            value: String::from_utf8_lossy(value).into_owned(),
        });

        Ok(())
    }

    #[inline]
    fn parse_header_connection(&mut self, value: &[u8]) {
        for token in value.split(|&b| b == b',').map(types::trim_ows) {
            if token.eq_ignore_ascii_case(b"close") {
                self.keep_alive = false;
            } else if token.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        }
    }
}

/// Splits on `\n`, dropping the trailing `\r` of each line.
struct Lines<'a> {
    src: &'a [u8],
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let end = memchr(b'\n', self.src)?;
        let line = &self.src[..end];
        self.src = &self.src[end + 1..];

        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }
}

#[cfg(test)]
mod request_self {
    use super::*;

    fn parse(src: &str) -> Result<ClientRequest, ErrorKind> {
        parse_head(src.as_bytes(), &ReqLimits::default(), 7)
    }

    #[test]
    fn parse_valid_request() {
        #[rustfmt::skip]
        let cases = [
            (
                "GET / HTTP/1.1\r\nHost: a\r\n\r\n",
                (Method::Get, "/", "", Version::Http11, None, false, false, true),
            ),
            (
                "GET /search?q=rust&page=2 HTTP/1.1\r\nHOST: a\r\n\r\n",
                (Method::Get, "/search", "q=rust&page=2", Version::Http11, None, false, false, true),
            ),
            (
                "POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: 17\r\n\r\n",
                (Method::Post, "/upload", "", Version::Http11, Some(17), false, false, true),
            ),
            (
                "PUT /f HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: Chunked\r\n\r\n",
                (Method::Put, "/f", "", Version::Http11, None, true, false, true),
            ),
            (
                "POST /f HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\nExpect: 100-Continue\r\n\r\n",
                (Method::Post, "/f", "", Version::Http11, Some(0), false, true, true),
            ),
            (
                "GET / HTTP/1.0\r\nHost: a\r\n\r\n",
                (Method::Get, "/", "", Version::Http10, None, false, false, false),
            ),
            (
                "HEAD / HTTP/1.0\r\nHost: a\r\nConnection: Keep-Alive\r\n\r\n",
                (Method::Head, "/", "", Version::Http10, None, false, false, true),
            ),
            (
                "DELETE /x HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
                (Method::Delete, "/x", "", Version::Http11, None, false, false, false),
            ),
            (
                "OPTIONS / HTTP/1.1\r\nHost:a\r\nX-Empty:\r\nX_Under: \t v \t\r\n\r\n",
                (Method::Options, "/", "", Version::Http11, None, false, false, true),
            ),
        ];

        for (src, (method, path, query, version, len, chunked, expect, keep_alive)) in cases {
            let request = parse(src).unwrap_or_else(|e| panic!("{src:?}: {e:?}"));

            assert_eq!(request.method(), method, "{src:?}");
            assert_eq!(request.path(), path, "{src:?}");
            assert_eq!(request.query(), query, "{src:?}");
            assert_eq!(request.version(), version, "{src:?}");
            assert_eq!(request.content_length(), len, "{src:?}");
            assert_eq!(request.is_chunked(), chunked, "{src:?}");
            assert_eq!(request.expects_continue(), expect, "{src:?}");
            assert_eq!(request.is_keep_alive(), keep_alive, "{src:?}");
            assert_eq!(request.connection_id(), 7);
        }
    }

    #[test]
    fn parse_invalid_request() {
        #[rustfmt::skip]
        let cases = [
            ("GET  / HTTP/1.1\r\nHost: a\r\n\r\n",              ErrorKind::InvalidRequestLine),
            ("GET / HTTP/1.1 \r\nHost: a\r\n\r\n",              ErrorKind::InvalidRequestLine),
            ("GET /\r\nHost: a\r\n\r\n",                        ErrorKind::InvalidRequestLine),
            ("GET index HTTP/1.1\r\nHost: a\r\n\r\n",           ErrorKind::InvalidRequestLine),
            ("BREW / HTTP/1.1\r\nHost: a\r\n\r\n",              ErrorKind::InvalidMethod),
            ("GET / HTTP/2.0\r\nHost: a\r\n\r\n",               ErrorKind::UnsupportedVersion),
            ("GET / HTTX/1.1\r\nHost: a\r\n\r\n",               ErrorKind::InvalidRequestLine),
            ("GET / HTTP/1.1\r\n\r\n",                          ErrorKind::MissingHost),
            ("GET / HTTP/1.1\r\nHost a\r\n\r\n",                ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: a\r\nHost: a\r\n\r\n",        ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nBad Name: a\r\nHost: a\r\n\r\n", ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nX.Y: a\r\nHost: a\r\n\r\n",     ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nHost: a\r\nhost: b\r\n\r\n",    ErrorKind::DuplicateHeader),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n",
                ErrorKind::DuplicateHeader,
            ),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\ncontent-length: 6\r\n\r\n",
                ErrorKind::DuplicateHeader,
            ),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5x\r\n\r\n", ErrorKind::InvalidContentLength),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: -1\r\n\r\n", ErrorKind::InvalidContentLength),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length:\r\n\r\n",    ErrorKind::InvalidContentLength),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n", ErrorKind::InvalidTransferEncoding),
            ("POST / HTTP/1.1\r\nHost: a\r\nExpect: 200-ok\r\n\r\n",    ErrorKind::ExpectationFailed),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
                ErrorKind::AmbiguousFraming,
            ),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n",
                ErrorKind::AmbiguousFraming,
            ),
            ("GET / HTTP/1.1\r\nHost: a\r\n",                   ErrorKind::InvalidHeader),
        ];

        for (src, expected) in cases {
            assert_eq!(parse(src), Err(expected), "{src:?}");
        }

        let invalid_utf8 = b"GET /\xff HTTP/1.1\r\nHost: a\r\n\r\n";
        assert_eq!(
            parse_head(invalid_utf8, &ReqLimits::default(), 0),
            Err(ErrorKind::InvalidEncoding)
        );
    }

    #[test]
    fn check_limits() {
        let limits = ReqLimits {
            uri_size: 8,
            header_count: 2,
            header_name_size: 4,
            header_value_size: 4,
            ..ReqLimits::default()
        };

        #[rustfmt::skip]
        let cases = [
            ("GET /1234567 HTTP/1.1\r\nHost: a\r\n\r\n",            Ok(())),
            ("GET /12345678 HTTP/1.1\r\nHost: a\r\n\r\n",           Err(ErrorKind::UriTooLong)),
            ("GET / HTTP/1.1\r\nHost: abcd\r\n\r\n",                Ok(())),
            ("GET / HTTP/1.1\r\nHost: abcde\r\n\r\n",               Err(ErrorKind::InvalidHeader)),
            ("GET / HTTP/1.1\r\nHost: a\r\nLong5: a\r\n\r\n",       Err(ErrorKind::InvalidHeader)),
            ("GET / HTTP/1.1\r\nHost: a\r\nX-A: a\r\n\r\n",         Ok(())),
            ("GET / HTTP/1.1\r\nHost: a\r\nX-A: a\r\nX-B: b\r\n\r\n", Err(ErrorKind::TooManyHeaders)),
        ];

        for (src, expected) in cases {
            let result = parse_head(src.as_bytes(), &limits, 0).map(|_| ());
            assert_eq!(result, expected, "{src:?}");
        }
    }

    #[test]
    fn headers_are_lowercased() {
        let request = parse("GET / HTTP/1.1\r\nHoSt: a\r\nUser-Agent: curl/8\r\n\r\n").unwrap();

        let names: Vec<_> = request.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["host", "user-agent"]);
        assert_eq!(request.header("USER-AGENT"), Some("curl/8"));
        assert_eq!(request.target(), "/");
    }
}
