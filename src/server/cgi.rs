//! CGI programs run as child processes whose stdout is polled by the same
//! task that owns the client socket.

use crate::{
    errors::ErrorKind,
    http::{request::ClientRequest, response::Response},
    StatusCode,
};
use memchr::memmem;
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdout, Command},
};

const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// One running CGI program bound to the connection that requested it.
///
/// Dropping a job kills the child; the runtime reaps it in the background.
#[derive(Debug)]
pub struct CgiJob {
    child: Child,
    stdout: ChildStdout,
    output: Vec<u8>,
    connection_id: u64,
    started: Instant,
}

impl CgiJob {
    /// Spawns `interpreter script` with the CGI environment of `request`.
    ///
    /// The request body is written to the child's stdin by a separate task
    /// so a program that reads slowly never stalls the connection.
    pub fn spawn(
        request: &ClientRequest,
        script: &Path,
        interpreter: &Path,
        upload_dir: Option<&Path>,
    ) -> Result<Self, ErrorKind> {
        let mut command = Command::new(interpreter);
        command
            .arg(script)
            .env_clear()
            .envs(environment(request, script, upload_dir))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            tracing::error!(script = %script.display(), error = %e, "cannot spawn CGI program");
            ErrorKind::CgiFailure
        })?;

        let stdout = child.stdout.take().ok_or(ErrorKind::CgiFailure)?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = request.body().to_vec();
            tokio::spawn(async move {
                if !body.is_empty() {
                    if let Err(e) = stdin.write_all(&body).await {
                        tracing::debug!(error = %e, "CGI program stopped reading its input");
                    }
                }
            });
        }

        tracing::debug!(
            connection = request.connection_id(),
            pid = child.id(),
            script = %script.display(),
            "CGI program started"
        );

        Ok(Self {
            child,
            stdout,
            output: Vec::new(),
            connection_id: request.connection_id(),
            started: Instant::now(),
        })
    }

    #[inline(always)]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[inline(always)]
    pub const fn started(&self) -> Instant {
        self.started
    }

    /// OS process id, `None` once the child has been reaped.
    #[inline(always)]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the pipe to deliver and appends what it has.
    ///
    /// Returns `true` once the pipe is closed. Cancel safe: no byte is lost
    /// if the future is dropped before it completes.
    pub async fn on_readable(&mut self) -> Result<bool, ErrorKind> {
        let mut buf = [0u8; 8192];

        loop {
            match self.stdout.read(&mut buf).await {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.output.extend_from_slice(&buf[..n]);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(connection = self.connection_id, error = %e, "CGI pipe read failed");
                    return Err(ErrorKind::CgiFailure);
                }
            }
        }
    }

    /// Reaps the child and turns the collected output into a response.
    ///
    /// `timeout` counts from the spawn. A program that closed its stdout but
    /// is still running when it elapses is killed and answered with
    /// [`ErrorKind::CgiTimeout`].
    pub async fn finish(mut self, timeout: Duration) -> Result<Response, ErrorKind> {
        let deadline = tokio::time::Instant::from_std(self.started) + timeout;

        let waited = tokio::time::timeout_at(deadline, self.child.wait()).await;

        match waited {
            Err(_) => {
                tracing::error!(
                    connection = self.connection_id,
                    pid = self.pid(),
                    "CGI program outlived its output"
                );
                return Err(self.abort(ErrorKind::CgiTimeout).await);
            }
            Ok(Ok(status)) => tracing::debug!(
                connection = self.connection_id,
                %status,
                elapsed = ?self.started.elapsed(),
                "CGI program exited"
            ),
            Ok(Err(e)) => {
                tracing::warn!(connection = self.connection_id, error = %e, "CGI wait failed")
            }
        }

        into_response(std::mem::take(&mut self.output))
    }

    /// Kills and reaps the child, returning `err` for the client.
    pub async fn abort(mut self, err: ErrorKind) -> ErrorKind {
        tracing::error!(connection = self.connection_id, error = %err, "aborting CGI program");

        if let Err(e) = self.child.kill().await {
            tracing::warn!(connection = self.connection_id, error = %e, "cannot kill CGI program");
        }
        err
    }
}

/// Environment handed to the CGI program.
pub(crate) fn environment(
    request: &ClientRequest,
    script: &Path,
    upload_dir: Option<&Path>,
) -> Vec<(String, OsString)> {
    let mut env: Vec<(String, OsString)> = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_PROTOCOL".into(), request.version().as_str().into()),
        ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ("REQUEST_METHOD".into(), request.method().as_str().into()),
        ("QUERY_STRING".into(), request.query().into()),
        ("SCRIPT_FILENAME".into(), script.as_os_str().to_owned()),
        ("SCRIPT_NAME".into(), request.path().into()),
        ("PATH_INFO".into(), request.path().into()),
        ("CONTENT_LENGTH".into(), request.body().len().to_string().into()),
        (
            "CONTENT_TYPE".into(),
            request.header("content-type").unwrap_or_default().into(),
        ),
        ("REDIRECT_STATUS".into(), "200".into()),
    ];

    if let Some(path) = std::env::var_os("PATH") {
        env.push(("PATH".into(), path));
    }
    if let Some(dir) = upload_dir {
        env.push(("UPLOAD_DIR".into(), PathBuf::from(dir).into_os_string()));
    }

    for (name, value) in request.headers().iter() {
        let name = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        env.push((name, value.into()));
    }

    env
}

/// Output that starts with a status line is forwarded verbatim; a CGI
/// header block is rewritten into a complete response.
pub(crate) fn into_response(output: Vec<u8>) -> Result<Response, ErrorKind> {
    if output.starts_with(b"HTTP/") {
        return Ok(Response::raw(output));
    }

    let (head, body) = match memmem::find(&output, b"\r\n\r\n") {
        Some(pos) => (&output[..pos], &output[pos + 4..]),
        None => match memmem::find(&output, b"\n\n") {
            Some(pos) => (&output[..pos], &output[pos + 2..]),
            None => return Err(ErrorKind::CgiFailure),
        },
    };
    let head = simdutf8::basic::from_utf8(head).map_err(|_| ErrorKind::CgiFailure)?;

    let mut status = None;
    let mut headers = Vec::new();
    for line in head.lines().map(|line| line.trim_end_matches('\r')) {
        let (name, value) = line.split_once(':').ok_or(ErrorKind::CgiFailure)?;
        let (name, value) = (name.trim(), value.trim());

        if name.is_empty() {
            return Err(ErrorKind::CgiFailure);
        }

        if name.eq_ignore_ascii_case("status") {
            let code = value
                .get(..3)
                .and_then(|code| code.parse().ok())
                .and_then(StatusCode::from_u16)
                .ok_or(ErrorKind::CgiFailure)?;
            status = Some(code);
        } else if !name.eq_ignore_ascii_case("content-length")
            && !name.eq_ignore_ascii_case("connection")
        {
            headers.push((name.to_ascii_lowercase(), value.to_owned()));
        }
    }

    let status = match status {
        Some(status) => status,
        None if headers.iter().any(|(name, _)| name == "location") => StatusCode::Found,
        None => StatusCode::Ok,
    };

    let response = headers
        .into_iter()
        .fold(Response::status(status), |response, (name, value)| {
            response.header(name, value)
        });
    Ok(response.body(body))
}

#[cfg(test)]
mod cgi_tests {
    use super::*;
    use crate::{http::request::parse_head, limits::ReqLimits};
    use std::fs;

    fn request(head: &str, body: &[u8]) -> ClientRequest {
        let mut request = parse_head(head.as_bytes(), &ReqLimits::default(), 3).unwrap();
        request.body = body.to_vec();
        request
    }

    fn script(dir: &Path, source: &str) -> PathBuf {
        let path = dir.join("script.sh");
        fs::write(&path, source).unwrap();
        path
    }

    async fn run(mut job: CgiJob) -> Result<Response, ErrorKind> {
        while !job.on_readable().await? {}
        job.finish(Duration::from_secs(10)).await
    }

    fn is_gone(pid: u32) -> bool {
        !Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    async fn verbatim_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = script(dir.path(), "printf 'HTTP/1.1 200 OK\\r\\n\\r\\npart'\n");
        let request = request("GET /s.sh HTTP/1.1\r\nHost: a\r\n\r\n", b"");

        let job = CgiJob::spawn(&request, &script, Path::new("/bin/sh"), None).unwrap();
        let bytes = run(job).await.unwrap().into_bytes();

        assert_eq!(bytes, b"HTTP/1.1 200 OK\r\n\r\npart");
    }

    #[tokio::test]
    async fn header_block_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = script(
            dir.path(),
            "printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\n\\r\\n'\ncat\n",
        );
        let request = request(
            "POST /s.sh HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\n",
            b"ping",
        );

        let job = CgiJob::spawn(&request, &script, Path::new("/bin/sh"), None).unwrap();
        let response = run(job).await.unwrap();

        assert_eq!(response.status_code(), Some(StatusCode::Created));
        assert_eq!(response.header_value("content-type"), Some("text/plain"));
        assert_eq!(response.body_bytes(), b"ping");
    }

    #[tokio::test]
    async fn environment_reaches_program() {
        let dir = tempfile::tempdir().unwrap();
        let script = script(
            dir.path(),
            "printf 'Content-Type: text/plain\\n\\n'\n\
             printf '%s|%s|%s|%s|%s' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \
             \"$HTTP_X_TOKEN\" \"$UPLOAD_DIR\" \"$GATEWAY_INTERFACE\"\n",
        );
        let request = request("GET /s.sh?a=1 HTTP/1.1\r\nHost: a\r\nX-Token: t0k\r\n\r\n", b"");

        let job =
            CgiJob::spawn(&request, &script, Path::new("/bin/sh"), Some(Path::new("/up"))).unwrap();
        let response = run(job).await.unwrap();

        assert_eq!(response.status_code(), Some(StatusCode::Ok));
        assert_eq!(response.body_bytes(), b"GET|a=1|t0k|/up|CGI/1.1");
    }

    #[tokio::test]
    async fn malformed_output_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let script = script(dir.path(), "printf 'no headers here'\n");
        let request = request("GET /s.sh HTTP/1.1\r\nHost: a\r\n\r\n", b"");

        let job = CgiJob::spawn(&request, &script, Path::new("/bin/sh"), None).unwrap();
        let err = run(job).await.unwrap_err();

        assert_eq!(err, ErrorKind::CgiFailure);
        assert_eq!(err.status(), StatusCode::BadGateway);
    }

    #[tokio::test]
    async fn abort_reaps_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = script(dir.path(), "sleep 30\n");
        let request = request("GET /s.sh HTTP/1.1\r\nHost: a\r\n\r\n", b"");

        let job = CgiJob::spawn(&request, &script, Path::new("/bin/sh"), None).unwrap();
        let pid = job.pid().unwrap();
        assert!(!is_gone(pid));

        let err = job.abort(ErrorKind::CgiFailure).await;

        assert_eq!(err.status(), StatusCode::BadGateway);
        assert!(is_gone(pid));
    }

    #[tokio::test]
    async fn lingering_program_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = script(
            dir.path(),
            "printf 'Content-Type: text/plain\\r\\n\\r\\nhi'\nexec 1>&-\nexec sleep 3\n",
        );
        let request = request("GET /s.sh HTTP/1.1\r\nHost: a\r\n\r\n", b"");

        let mut job = CgiJob::spawn(&request, &script, Path::new("/bin/sh"), None).unwrap();
        let pid = job.pid().unwrap();
        while !job.on_readable().await.unwrap() {}

        let begin = Instant::now();
        let err = job.finish(Duration::from_millis(200)).await.unwrap_err();

        assert_eq!(err, ErrorKind::CgiTimeout);
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert!(is_gone(pid));
    }

    #[tokio::test]
    async fn missing_interpreter() {
        let request = request("GET /s.sh HTTP/1.1\r\nHost: a\r\n\r\n", b"");
        let result = CgiJob::spawn(
            &request,
            Path::new("/tmp/s.sh"),
            Path::new("/definitely/not/an/interpreter"),
            None,
        );

        assert_eq!(result.unwrap_err(), ErrorKind::CgiFailure);
    }

    #[test]
    fn output_shapes() {
        #[rustfmt::skip]
        let cases: [(&[u8], Result<(u16, &[u8]), ErrorKind>); 6] = [
            (b"Content-Type: text/html\r\n\r\n<p>",      Ok((200, b"<p>"))),
            (b"Status: 404 Not Found\n\nmissing",         Ok((404, b"missing"))),
            (b"Location: /next\r\n\r\n",                  Ok((302, b""))),
            (b"Status: abc\r\n\r\n",                      Err(ErrorKind::CgiFailure)),
            (b"just text",                                Err(ErrorKind::CgiFailure)),
            (b"",                                         Err(ErrorKind::CgiFailure)),
        ];

        for (output, expected) in cases {
            let result = into_response(output.to_vec())
                .map(|r| (r.status_code().map_or(0, |s| s.as_u16()), r.body_bytes().to_vec()));
            let expected = expected.map(|(status, body)| (status, body.to_vec()));

            assert_eq!(result, expected, "{output:?}");
        }
    }
}
