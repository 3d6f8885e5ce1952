use crate::{
    config::Site,
    errors::ErrorKind,
    http::{
        chunked::{self, Step},
        request::{self, ClientRequest},
        response::Response,
    },
    limits::ReqLimits,
    routing::{self, RouteMatch},
};
use memchr::memmem;
use std::{mem, sync::Arc, time::Instant};

/// Phase of the in-flight request. Each body phase carries the scratch
/// data it needs and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingHeaders,
    ReadingBody { expected: usize },
    /// `100 Continue` was staged; the body framing resumes with the next bytes.
    ContinueSent { then: Framing },
    ReadingChunkSize,
    ReadingChunkData { remaining: usize },
    ReadingTrailer,
    /// Terminal for chunked bodies.
    ChunkComplete,
    /// Terminal for everything else, errors included.
    RequestComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(usize),
    Chunked,
}

impl Framing {
    #[inline]
    const fn state(self) -> ConnState {
        match self {
            Framing::Length(expected) => ConnState::ReadingBody { expected },
            Framing::Chunked => ConnState::ReadingChunkSize,
        }
    }
}

/// One client connection: buffers, parse state and the staged reply.
///
/// Purely byte driven. The server task feeds it socket reads through
/// [`on_readable`](Connection::on_readable) and writes out whatever it
/// stages; no I/O happens here.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    site: Arc<Site>,
    limits: ReqLimits,
    json_errors: bool,

    input: Vec<u8>,
    head: Vec<u8>,
    body: Vec<u8>,
    state: ConnState,

    request: Option<ClientRequest>,
    route: Option<RouteMatch>,
    ceiling: Option<usize>,

    keep_alive: bool,
    close: bool,
    request_count: usize,
    last_activity: Instant,

    interim: Option<Response>,
    continue_staged: bool,
    staged: Option<Response>,
}

impl Connection {
    pub fn new(site: Arc<Site>, limits: ReqLimits, json_errors: bool) -> Self {
        Self {
            id: 0,
            site,
            limits,
            json_errors,

            input: Vec::with_capacity(4096),
            head: Vec::with_capacity(1024),
            body: Vec::new(),
            state: ConnState::ReadingHeaders,

            request: None,
            route: None,
            ceiling: None,

            keep_alive: true,
            close: false,
            request_count: 0,
            last_activity: Instant::now(),

            interim: None,
            continue_staged: false,
            staged: None,
        }
    }

    /// Prepares a pooled object for a freshly accepted socket.
    pub(crate) fn open(&mut self, id: u64) {
        self.id = id;
        self.input.clear();
        self.reset_request();
        self.close = false;
        self.request_count = 0;
        self.last_activity = Instant::now();
    }

    // Per-request fields only; counters and pipelined input survive
    fn reset_request(&mut self) {
        self.head.clear();
        self.body.clear();
        self.state = ConnState::ReadingHeaders;
        self.request = None;
        self.route = None;
        self.ceiling = None;
        self.keep_alive = true;
        self.interim = None;
        self.continue_staged = false;
        self.staged = None;
    }
}

// Public API
impl Connection {
    #[inline(always)]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub const fn state(&self) -> ConnState {
        self.state
    }

    #[inline(always)]
    pub const fn request_count(&self) -> usize {
        self.request_count
    }

    #[inline(always)]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Route of the in-flight request once its head was accepted.
    #[inline(always)]
    pub fn route(&self) -> Option<&RouteMatch> {
        self.route.as_ref()
    }

    #[inline(always)]
    pub fn request(&self) -> Option<&ClientRequest> {
        self.request.as_ref()
    }

    /// The in-flight request reached a terminal state.
    #[inline(always)]
    pub const fn is_complete(&self) -> bool {
        matches!(
            self.state,
            ConnState::RequestComplete | ConnState::ChunkComplete
        )
    }

    /// A response is waiting to be written.
    #[inline(always)]
    pub const fn has_response(&self) -> bool {
        self.staged.is_some()
    }

    /// More socket bytes would be buffered rather than dropped.
    #[inline]
    pub fn wants_input(&self) -> bool {
        !self.is_complete() || (!self.close && self.input.len() < self.limits.header_block_size)
    }

    /// The socket must be closed once the staged response is written.
    #[inline(always)]
    pub const fn should_close(&self) -> bool {
        self.close
    }

    /// Appends freshly read bytes and advances the state machine as far as
    /// they allow. Returns [`is_complete()`](Self::is_complete).
    ///
    /// Bytes arriving while a request is already complete are kept for the
    /// next request, up to one header block. Past that they are dropped and
    /// the connection closes after the in-flight response.
    pub fn on_readable(&mut self, bytes: &[u8]) -> bool {
        self.last_activity = Instant::now();

        if self.is_complete() {
            let room = self.limits.header_block_size.saturating_sub(self.input.len());
            if self.close || bytes.len() > room {
                if !self.close {
                    tracing::warn!(
                        connection = self.id,
                        buffered = self.input.len(),
                        dropped = bytes.len(),
                        "pipelined input over the header block limit"
                    );
                    self.close = true;
                }
                return true;
            }
        }
        self.input.extend_from_slice(bytes);

        if !self.is_complete() {
            self.advance();
        }
        self.is_complete()
    }

    /// Stages the one response of the in-flight request.
    ///
    /// A second attempt is rejected and leaves the first response intact.
    pub fn stage_response(&mut self, response: Response) -> Result<(), ErrorKind> {
        if self.staged.is_some() {
            tracing::error!(
                connection = self.id,
                "a response was already staged for this request"
            );
            return Err(ErrorKind::ResponseAlreadyStaged);
        }

        self.staged = Some(response);
        Ok(())
    }

    /// Ends the in-flight request with the canned response for `err`.
    pub fn fail(&mut self, err: ErrorKind) {
        tracing::warn!(connection = self.id, error = %err, "request failed");

        if err.closes_connection() || self.unread_body() {
            self.close = true;
        }
        self.state = ConnState::RequestComplete;

        let mut response = err.response(self.json_errors);
        if let (ErrorKind::MethodNotAllowed, Some(route)) = (&err, &self.route) {
            response = response.header("allow", route.location.allow_header());
        }

        let _ = self.stage_response(response);
    }

    /// Takes the completed request for dispatch, body attached.
    #[inline]
    pub fn take_request(&mut self) -> Option<ClientRequest> {
        match self.is_complete() && self.staged.is_none() {
            true => self.request.take(),
            false => None,
        }
    }

    /// The pending `100 Continue`, handed out at most once per request.
    #[inline]
    pub fn take_interim(&mut self) -> Option<Response> {
        self.interim.take()
    }

    /// Takes the staged response with its final persistence decided.
    pub fn take_response(&mut self) -> Option<Response> {
        let mut response = self.staged.take()?;

        response.set_keep_alive(self.keep_alive && !self.close);
        if !response.is_keep_alive() {
            self.close = true;
        }

        Some(response)
    }

    /// Resets for the next request on a persistent connection and parses
    /// any pipelined bytes already buffered. Returns
    /// [`is_complete()`](Self::is_complete).
    pub fn next_request(&mut self) -> bool {
        self.request_count += 1;
        self.reset_request();

        if !self.input.is_empty() {
            self.advance();
        }
        self.is_complete()
    }

    /// Header block followed by the decoded body, as received.
    pub fn raw_request(&self) -> Vec<u8> {
        let body = self.request.as_ref().map_or(&self.body[..], |r| &r.body[..]);

        let mut raw = Vec::with_capacity(self.head.len() + body.len());
        raw.extend_from_slice(&self.head);
        raw.extend_from_slice(body);
        raw
    }
}

// State machine
impl Connection {
    fn advance(&mut self) {
        loop {
            let progressed = match self.state {
                ConnState::ReadingHeaders => self.step_headers(),
                ConnState::ReadingBody { expected } => self.step_body(expected),
                ConnState::ContinueSent { then } => Ok(self.step_continue(then)),
                ConnState::ReadingChunkSize => self.step_chunk_size(),
                ConnState::ReadingChunkData { remaining } => self.step_chunk_data(remaining),
                ConnState::ReadingTrailer => self.step_trailer(),
                ConnState::ChunkComplete | ConnState::RequestComplete => Ok(false),
            };

            match progressed {
                Ok(true) if !self.is_complete() => continue,
                Ok(_) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
    }

    fn finish(&mut self, state: ConnState) {
        self.state = state;
        if let Some(request) = self.request.as_mut() {
            request.body = mem::take(&mut self.body);
        }
        tracing::debug!(connection = self.id, "request complete");
    }

    fn step_headers(&mut self) -> Result<bool, ErrorKind> {
        let Some(pos) = memmem::find(&self.input, b"\r\n\r\n") else {
            return match self.input.len() > self.limits.header_block_size {
                true => Err(ErrorKind::HeadersTooLarge),
                false => Ok(false),
            };
        };

        let end = pos + 4;
        if end > self.limits.header_block_size {
            return Err(ErrorKind::HeadersTooLarge);
        }

        // Leftover bytes stay in `input` and are only ever read as body
        self.head.extend_from_slice(&self.input[..end]);
        self.input.drain(..end);

        let request = request::parse_head(&self.head, &self.limits, self.id)?;
        tracing::debug!(
            connection = self.id,
            method = %request.method(),
            target = request.target(),
            "request head parsed"
        );

        self.keep_alive = request.is_keep_alive();
        let framing = match (request.is_chunked(), request.content_length()) {
            (true, _) => Some(Framing::Chunked),
            (false, Some(len)) => Some(Framing::Length(len)),
            (false, None) => None,
        };
        let (method, expect) = (request.method(), request.expects_continue());
        let declared = request.content_length();
        self.request = Some(request);

        let route = {
            let path = self.request.as_ref().map_or("", |r| r.path());
            routing::find_best_match(path, &self.site.locations).ok_or(ErrorKind::NoRoute)?
        };
        self.ceiling = self.site.body_ceiling(&route.location);
        let location = Arc::clone(&route.location);
        self.route = Some(route);

        if let (true, Some(redirect)) = (self.route_is_exact(), &location.redirect) {
            let response = Response::redirect(redirect.status, &redirect.target);
            self.answer_early(response);
            return Ok(true);
        }

        if !location.allows(method) {
            return Err(ErrorKind::MethodNotAllowed);
        }
        if let (Some(len), Some(ceiling)) = (declared, self.ceiling) {
            if len > ceiling {
                return Err(ErrorKind::BodyTooLarge);
            }
        }

        match framing {
            Some(Framing::Length(0)) => {
                if expect {
                    self.stage_continue();
                }
                self.finish(ConnState::RequestComplete);
            }
            Some(framing) if expect => {
                self.stage_continue();
                self.state = ConnState::ContinueSent { then: framing };
            }
            Some(framing) => self.state = framing.state(),
            None if method.requires_length() => return Err(ErrorKind::LengthRequired),
            None => {
                if expect {
                    self.stage_continue();
                }
                self.finish(ConnState::RequestComplete);
            }
        }

        Ok(true)
    }

    fn step_continue(&mut self, then: Framing) -> bool {
        match self.input.is_empty() {
            true => false,
            false => {
                self.state = then.state();
                true
            }
        }
    }

    fn step_body(&mut self, expected: usize) -> Result<bool, ErrorKind> {
        if self.input.is_empty() {
            return Ok(false);
        }

        self.body.append(&mut self.input);

        match self.body.len() {
            received if received > expected => Err(ErrorKind::BodyMismatch { expected, received }),
            received if received == expected => {
                self.finish(ConnState::RequestComplete);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn step_chunk_size(&mut self) -> Result<bool, ErrorKind> {
        match chunked::chunk_size(&self.input, self.limits.chunk_line_size)? {
            Step::NeedMore => Ok(false),
            Step::Done { consumed, value: 0 } => {
                self.input.drain(..consumed);
                self.state = ConnState::ReadingTrailer;
                Ok(true)
            }
            Step::Done { consumed, value } => {
                if let Some(ceiling) = self.ceiling {
                    if self.body.len().saturating_add(value) > ceiling {
                        return Err(ErrorKind::BodyTooLarge);
                    }
                }

                self.input.drain(..consumed);
                self.state = ConnState::ReadingChunkData { remaining: value };
                Ok(true)
            }
        }
    }

    fn step_chunk_data(&mut self, remaining: usize) -> Result<bool, ErrorKind> {
        match chunked::chunk_data(&self.input, remaining, &mut self.body)? {
            Step::NeedMore => Ok(false),
            Step::Done { consumed, value } => {
                self.input.drain(..consumed);
                self.state = match remaining {
                    0 => ConnState::ReadingChunkSize,
                    _ => ConnState::ReadingChunkData {
                        remaining: remaining - value,
                    },
                };
                Ok(true)
            }
        }
    }

    fn step_trailer(&mut self) -> Result<bool, ErrorKind> {
        match chunked::trailer(&self.input, self.limits.chunk_line_size)? {
            Step::NeedMore => Ok(false),
            Step::Done { consumed, value } => {
                self.input.drain(..consumed);
                if value {
                    self.finish(ConnState::ChunkComplete);
                }
                Ok(true)
            }
        }
    }

    #[inline]
    fn route_is_exact(&self) -> bool {
        self.route.as_ref().is_some_and(|route| route.exact)
    }

    fn stage_continue(&mut self) {
        if !self.continue_staged {
            self.continue_staged = true;
            self.interim = Some(Response::continue_());
        }
    }

    // Policy answer given before the body was read
    fn answer_early(&mut self, response: Response) {
        if self.unread_body() {
            self.close = true;
        }
        self.state = ConnState::RequestComplete;
        let _ = self.stage_response(response);
    }

    fn unread_body(&self) -> bool {
        match self.state {
            ConnState::ReadingHeaders => self.request.as_ref().is_some_and(|r| {
                r.is_chunked() || r.content_length().is_some_and(|len| len > 0)
            }),
            ConnState::RequestComplete | ConnState::ChunkComplete => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod close_tests {
    use super::*;
    use crate::{routing::Location, Method, StatusCode};

    fn site() -> Arc<Site> {
        let mut root = Location::new("/", "/srv");
        root.methods = vec![Method::Get, Method::Head, Method::Post, Method::Put];

        let mut small = Location::new("/small", "/srv");
        small.methods = vec![Method::Post];
        small.max_body_size = Some(8);

        let mut old = Location::new("/old", "/srv");
        old.redirect = Some(routing::Redirect {
            status: StatusCode::MovedPermanently,
            target: "/new".into(),
        });

        let readonly = Location::new("/ro", "/srv");

        Arc::new(Site {
            listen: "127.0.0.1:0".parse().unwrap(),
            root_prefix: String::new(),
            max_body_size: Some(1024),
            locations: [small, old, readonly, root].into_iter().map(Arc::new).collect(),
        })
    }

    fn open_conn() -> Connection {
        let mut conn = Connection::new(site(), ReqLimits::default(), false);
        conn.open(1);
        conn
    }

    fn status(conn: &mut Connection) -> u16 {
        conn.take_response()
            .and_then(|r| r.status_code())
            .map_or(0, |s| s.as_u16())
    }

    const BODY: &[u8] = b"a\r\n\r\nb\x00\xffz";

    fn post(body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn body_in_any_split() {
        let raw = post(BODY);
        let head_len = raw.len() - BODY.len();

        let splits: [Vec<&[u8]>; 4] = [
            vec![&raw[..]],
            raw.chunks(1).collect(),
            vec![&raw[..head_len + 3], &raw[head_len + 3..]],
            vec![&raw[..head_len - 2], &raw[head_len - 2..head_len], &raw[head_len..]],
        ];

        for parts in splits {
            let mut conn = open_conn();
            let last = parts.len() - 1;

            for (i, part) in parts.iter().enumerate() {
                assert_eq!(conn.on_readable(part), i == last, "part {i}");
            }

            assert_eq!(conn.raw_request(), raw);
            let request = conn.take_request().unwrap();
            assert_eq!(request.body(), BODY);
            assert_eq!(request.path(), "/upload");
        }
    }

    #[test]
    fn body_excess_closes() {
        let mut raw = post(b"abc");
        raw.push(b'd');

        let mut conn = open_conn();
        assert!(conn.on_readable(&raw));
        assert!(conn.take_request().is_none());
        assert_eq!(status(&mut conn), 400);
        assert!(conn.should_close());
    }

    #[test]
    fn framing_violations() {
        #[rustfmt::skip]
        let cases: [(&str, u16); 9] = [
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n", 400),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n", 400),
            ("GET / HTTP/1.1\r\nUser-Agent: x\r\n\r\n", 400),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\nabc", 400),
            ("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabc", 400),
            ("POST / HTTP/1.1\r\nHost: a\r\n\r\n", 411),
            ("POST / HTTP/1.1\r\nHost: a\r\nExpect: nothing\r\n\r\n", 417),
            ("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n", 400),
            ("GET / HTTP/3.0\r\nHost: a\r\n\r\n", 505),
        ];

        for (raw, expected) in cases {
            let mut conn = open_conn();
            assert!(conn.on_readable(raw.as_bytes()), "{raw:?}");
            assert_eq!(status(&mut conn), expected, "{raw:?}");
            assert!(conn.should_close(), "{raw:?}");
        }
    }

    #[test]
    fn oversized_head() {
        let limits = ReqLimits {
            header_block_size: 64,
            ..ReqLimits::default()
        };
        let mut conn = Connection::new(site(), limits, false);

        assert!(!conn.on_readable(b"GET / HTTP/1.1\r\nHost: a\r\n"));
        assert!(conn.on_readable(&[b'x'; 64]));
        assert_eq!(status(&mut conn), 431);
    }

    #[test]
    fn continue_once_for_empty_body() {
        let mut conn = open_conn();
        let raw = "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\nExpect: 100-continue\r\n\r\n";

        assert!(conn.on_readable(raw.as_bytes()));

        let interim = conn.take_interim().unwrap().into_bytes();
        assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n");
        assert!(conn.take_interim().is_none());

        let request = conn.take_request().unwrap();
        assert!(request.body().is_empty());

        conn.stage_response(Response::status(StatusCode::Ok).body("")).unwrap();
        assert_eq!(status(&mut conn), 200);
        assert!(conn.take_interim().is_none());
    }

    #[test]
    fn continue_then_body() {
        let mut conn = open_conn();
        let raw = "PUT /f HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n";

        assert!(!conn.on_readable(raw.as_bytes()));
        assert_eq!(
            conn.state(),
            ConnState::ContinueSent {
                then: Framing::Length(5)
            }
        );
        assert!(conn.take_interim().is_some());

        assert!(!conn.on_readable(b"he"));
        assert_eq!(conn.state(), ConnState::ReadingBody { expected: 5 });
        assert!(conn.on_readable(b"llo"));
        assert!(conn.take_interim().is_none());
        assert_eq!(conn.take_request().unwrap().body(), b"hello");
    }

    #[test]
    fn chunked_byte_at_a_time() {
        let mut raw = b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(b"5;x=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Check: 1\r\n\r\n");

        let mut conn = open_conn();
        let (last, head) = raw.split_last().unwrap();
        for byte in head {
            assert!(!conn.on_readable(&[*byte]));
        }
        assert!(conn.on_readable(&[*last]));

        assert_eq!(conn.state(), ConnState::ChunkComplete);
        let request = conn.take_request().unwrap();
        assert_eq!(request.body(), b"hello world");
        assert!(request.is_chunked());
    }

    #[test]
    fn chunked_with_continue() {
        let raw = "POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nExpect: 100-continue\r\n\r\n";

        let mut conn = open_conn();
        assert!(!conn.on_readable(raw.as_bytes()));
        assert!(conn.take_interim().is_some());
        assert!(conn.on_readable(b"3\r\nabc\r\n0\r\n\r\n"));
        assert_eq!(conn.take_request().unwrap().body(), b"abc");
    }

    #[test]
    fn body_ceilings() {
        #[rustfmt::skip]
        let cases: [(&[u8], u16); 3] = [
            (b"POST /small HTTP/1.1\r\nHost: a\r\nContent-Length: 9\r\n\r\n", 413),
            (b"POST /small HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n4\r\n", 413),
            (b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 1025\r\n\r\n", 413),
        ];

        for (raw, expected) in cases {
            let mut conn = open_conn();
            assert!(conn.on_readable(raw));
            assert_eq!(status(&mut conn), expected);
            assert!(conn.should_close());
        }

        let mut conn = open_conn();
        assert!(conn.on_readable(b"POST /small HTTP/1.1\r\nHost: a\r\nContent-Length: 8\r\n\r\n12345678"));
        assert_eq!(conn.take_request().unwrap().body(), b"12345678");
    }

    #[test]
    fn policy_rejections() {
        let mut conn = open_conn();
        assert!(conn.on_readable(b"DELETE /ro/x HTTP/1.1\r\nHost: a\r\n\r\n"));
        let response = conn.take_response().unwrap();
        assert_eq!(response.status_code(), Some(StatusCode::MethodNotAllowed));
        assert_eq!(response.header_value("allow"), Some("GET, HEAD"));
        assert!(response.is_keep_alive());
        assert!(!conn.should_close());

        let mut conn = open_conn();
        assert!(conn.on_readable(b"GET /old HTTP/1.1\r\nHost: a\r\n\r\n"));
        let response = conn.take_response().unwrap();
        assert_eq!(response.status_code(), Some(StatusCode::MovedPermanently));
        assert_eq!(response.header_value("location"), Some("/new"));

        let mut conn = open_conn();
        assert!(conn.on_readable(b"GET /old/page HTTP/1.1\r\nHost: a\r\n\r\n"));
        assert!(conn.take_request().is_some());

        let mut conn = open_conn();
        assert!(conn.on_readable(b"POST /ro HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\n"));
        assert_eq!(status(&mut conn), 405);
        assert!(conn.should_close());
    }

    #[test]
    fn no_route() {
        let site = Arc::new(Site {
            locations: vec![Arc::new(Location::new("/images", "/srv"))],
            ..(*site()).clone()
        });
        let mut conn = Connection::new(site, ReqLimits::default(), false);

        assert!(conn.on_readable(b"GET /other HTTP/1.1\r\nHost: a\r\n\r\n"));
        assert_eq!(status(&mut conn), 500);
    }

    #[test]
    fn pipelined_requests() {
        let mut conn = open_conn();
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";

        assert!(conn.on_readable(raw));
        assert_eq!(conn.take_request().unwrap().path(), "/a");
        conn.stage_response(Response::status(StatusCode::Ok).body("a")).unwrap();
        assert!(conn.take_response().unwrap().is_keep_alive());

        assert!(conn.next_request());
        assert_eq!(conn.request_count(), 1);
        assert_eq!(conn.take_request().unwrap().path(), "/b");
        conn.stage_response(Response::status(StatusCode::Ok).body("b")).unwrap();
        assert!(!conn.take_response().unwrap().is_keep_alive());
        assert!(conn.should_close());
    }

    #[test]
    fn carried_input_is_capped() {
        let mut conn = open_conn();
        let limit = ReqLimits::default().header_block_size;

        assert!(conn.on_readable(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n"));
        let request = conn.take_request().unwrap();
        assert_eq!(request.path(), "/a");

        let chunk = vec![b'x'; 1 << 20];
        for _ in 0..64 {
            assert!(conn.on_readable(&chunk));
            assert!(conn.input.len() <= limit);
        }
        assert!(!conn.wants_input());
        assert!(conn.should_close());

        conn.stage_response(Response::status(StatusCode::Ok).body("a")).unwrap();
        assert!(!conn.take_response().unwrap().is_keep_alive());
    }

    #[test]
    fn carried_input_within_limit() {
        let mut conn = open_conn();
        assert!(conn.on_readable(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n"));
        conn.take_request().unwrap();

        assert!(conn.on_readable(b"GET /b HTTP/1.1\r\n"));
        assert!(conn.wants_input());
        assert!(conn.on_readable(b"Host: x\r\n\r\n"));
        assert!(!conn.should_close());

        conn.stage_response(Response::status(StatusCode::Ok).body("a")).unwrap();
        assert!(conn.take_response().unwrap().is_keep_alive());
        assert!(conn.next_request());
        assert_eq!(conn.take_request().unwrap().path(), "/b");
    }

    #[test]
    fn http10_closes_by_default() {
        let mut conn = open_conn();
        assert!(conn.on_readable(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n"));
        conn.take_request().unwrap();
        conn.stage_response(Response::status(StatusCode::Ok).body("")).unwrap();

        assert!(!conn.take_response().unwrap().is_keep_alive());
        assert!(conn.should_close());
    }

    #[test]
    fn second_stage_is_rejected() {
        let mut conn = open_conn();
        assert!(conn.on_readable(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"));
        conn.take_request().unwrap();

        conn.stage_response(Response::status(StatusCode::Ok).body("first")).unwrap();
        assert_eq!(
            conn.stage_response(Response::status(StatusCode::NotFound).body("second")),
            Err(ErrorKind::ResponseAlreadyStaged)
        );

        assert_eq!(conn.take_response().unwrap().body_bytes(), b"first");
    }
}
