use crate::http::{response::Response, types::StatusCode};
use std::{error, fmt, io, path::PathBuf};

/// Every way a request can fail on its way through the pipeline.
///
/// Each variant maps to exactly one status code. Parsers and validators
/// return these instead of panicking; the connection turns them into a
/// terminal state plus one staged response.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    InvalidRequestLine,
    InvalidMethod,
    UriTooLong,
    UnsupportedVersion,

    InvalidHeader,
    DuplicateHeader,
    TooManyHeaders,
    HeadersTooLarge,
    InvalidEncoding,
    MissingHost,
    InvalidTransferEncoding,
    InvalidContentLength,
    AmbiguousFraming,
    ExpectationFailed,
    LengthRequired,

    InvalidChunk,
    BodyMismatch {
        expected: usize,
        received: usize,
    },
    BodyTooLarge,

    NoRoute,
    MethodNotAllowed,
    Traversal,
    NotFound,
    PermissionDenied,
    FileSystem,

    CgiFailure,
    CgiTimeout,

    ResponseAlreadyStaged,
    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status:ident, $close:literal => $code:literal, $message:literal;)*) => {
        /// Status code sent to the client for this error.
        pub const fn status(&self) -> StatusCode {
            match self { $(
                Self::$name { .. } => StatusCode::$status,
            )* }
        }

        /// `true` when the byte stream can no longer be trusted to stay
        /// in sync and the connection must be closed after the response.
        pub const fn closes_connection(&self) -> bool {
            match self { $(
                Self::$name { .. } => $close,
            )* }
        }

        /// Stable machine readable error code.
        pub const fn code(&self) -> &'static str {
            match self { $(
                Self::$name { .. } => $code,
            )* }
        }

        const fn message(&self) -> &'static str {
            match self { $(
                Self::$name { .. } => $message,
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidRequestLine: BadRequest, true => "INVALID_REQUEST_LINE", "Malformed request line";
        InvalidMethod: BadRequest, true => "INVALID_METHOD", "Invalid HTTP method";
        UriTooLong: UriTooLong, true => "URI_TOO_LONG", "Request URI too long";
        UnsupportedVersion: HttpVersionNotSupported, true
            => "UNSUPPORTED_VERSION", "HTTP version not supported";

        InvalidHeader: BadRequest, true => "INVALID_HEADER", "Invalid header format";
        DuplicateHeader: BadRequest, true => "DUPLICATE_HEADER", "Duplicate header";
        TooManyHeaders: BadRequest, true => "TOO_MANY_HEADERS", "Too many headers";
        HeadersTooLarge: RequestHeaderFieldsTooLarge, true
            => "HEADERS_TOO_LARGE", "Header section too large";
        InvalidEncoding: BadRequest, true => "INVALID_ENCODING", "Header section is not UTF-8";
        MissingHost: BadRequest, true => "MISSING_HOST", "Missing Host header";
        InvalidTransferEncoding: BadRequest, true
            => "INVALID_TRANSFER_ENCODING", "Unsupported Transfer-Encoding";
        InvalidContentLength: BadRequest, true
            => "INVALID_CONTENT_LENGTH", "Invalid Content-Length";
        AmbiguousFraming: BadRequest, true
            => "AMBIGUOUS_FRAMING", "Content-Length together with chunked encoding";
        ExpectationFailed: ExpectationFailed, true
            => "EXPECTATION_FAILED", "Unsupported Expect value";
        LengthRequired: LengthRequired, true => "LENGTH_REQUIRED", "Content-Length required";

        InvalidChunk: BadRequest, true => "INVALID_CHUNK", "Malformed chunked body";
        BodyMismatch: BadRequest, true => "BODY_MISMATCH", "Body length mismatch";
        BodyTooLarge: PayloadTooLarge, true => "BODY_TOO_LARGE", "Request body too large";

        NoRoute: InternalServerError, false => "NO_ROUTE", "No location matches the request";
        MethodNotAllowed: MethodNotAllowed, false => "METHOD_NOT_ALLOWED", "Method not allowed";
        Traversal: Forbidden, false => "FORBIDDEN", "Access outside of the document root";
        NotFound: NotFound, false => "NOT_FOUND", "Resource not found";
        PermissionDenied: Forbidden, false => "FORBIDDEN", "Permission denied";
        FileSystem: InternalServerError, false => "FILE_SYSTEM", "File system error";

        CgiFailure: BadGateway, false => "CGI_FAILURE", "CGI program failed";
        CgiTimeout: GatewayTimeout, true => "CGI_TIMEOUT", "CGI program timed out";

        ResponseAlreadyStaged: InternalServerError, true
            => "RESPONSE_ALREADY_STAGED", "A response was already staged";
        ServiceUnavailable: ServiceUnavailable, true
            => "SERVICE_UNAVAILABLE", "Service temporarily unavailable";
        Io: ServiceUnavailable, true => "IO_ERROR", "I/O error occurred";
    }

    /// Renders the canned error response.
    ///
    /// With `json` set the body is `{"error":"..","code":".."}`, otherwise
    /// the response carries an empty body.
    pub fn response(&self, json: bool) -> Response {
        let response = Response::status(self.status());
        let response = match self.closes_connection() {
            true => response.close(),
            false => response,
        };

        match json {
            true => response
                .header("content-type", "application/json")
                .body(format!(
                    r#"{{"error":"{}","code":"{}"}}"#,
                    self.message(),
                    self.code()
                )),
            false => response.body(""),
        }
    }

    /// Maps a filesystem lookup failure onto the 404 / 403 / 500 classes.
    pub(crate) fn from_fs(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            // ENOTDIR: a path component is a regular file
            _ if err.raw_os_error() == Some(20) => ErrorKind::NotFound,
            _ => ErrorKind::FileSystem,
        }
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::BodyMismatch { expected, received } => write!(
                f,
                "{}: expected {expected} bytes, received {received} ({})",
                self.message(),
                self.status().as_u16()
            ),
            _ => write!(f, "{} ({})", self.message(), self.status().as_u16()),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Errors raised while loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl error::Error for ConfigError {}
impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}
