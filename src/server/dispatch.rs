//! Turns a complete request into a response or a running CGI job.
//!
//! Routing, redirects, method and declared body checks already happened when
//! the head was parsed. What is left needs the filesystem.

use crate::{
    config::Site,
    errors::ErrorKind,
    http::{request::ClientRequest, response::Response},
    routing::{self, RouteMatch},
    server::{cgi::CgiJob, files},
    Method, StatusCode,
};
use std::path::{Path, PathBuf};
use tokio::fs;

/// What the connection does next with a dispatched request.
#[derive(Debug)]
pub enum Outcome {
    Respond(Response),
    /// The response arrives once the program finishes.
    Cgi(CgiJob),
}

/// Maps `request` onto the location that `route` selected.
///
/// Directories without a trailing slash and files with one are redirected
/// first, so no CGI program ever runs for a non canonical URI.
pub async fn dispatch(
    request: &ClientRequest,
    route: &RouteMatch,
    site: &Site,
) -> Result<Outcome, ErrorKind> {
    let location = &route.location;
    let resolved = routing::resolve_path(&site.root_prefix, location, request.path())?;

    let meta = fs::metadata(&resolved.path)
        .await
        .map_err(|e| ErrorKind::from_fs(&e))?;

    if meta.is_dir() {
        if !resolved.trailing_slash {
            let target = with_query(&format!("{}/", request.path()), request.query());
            return Ok(Outcome::Respond(Response::redirect(
                StatusCode::MovedPermanently,
                &target,
            )));
        }

        return directory(request, route, &resolved.path).await.map(Outcome::Respond);
    }

    if !meta.is_file() {
        return Err(ErrorKind::PermissionDenied);
    }

    if resolved.trailing_slash {
        let path = request.path().trim_end_matches('/');
        let target = with_query(if path.is_empty() { "/" } else { path }, request.query());
        return Ok(Outcome::Respond(Response::redirect(
            StatusCode::MovedPermanently,
            &target,
        )));
    }

    if let Some(interpreter) = location.cgi_interpreter(&resolved.path) {
        let upload_dir = location.upload_dir.as_deref().map(|dir| {
            PathBuf::from(routing::join_root(&site.root_prefix, &location.root)).join(dir)
        });

        return CgiJob::spawn(request, &resolved.path, interpreter, upload_dir.as_deref())
            .map(Outcome::Cgi);
    }

    static_file(request, &resolved.path).await.map(Outcome::Respond)
}

async fn directory(
    request: &ClientRequest,
    route: &RouteMatch,
    dir: &Path,
) -> Result<Response, ErrorKind> {
    let location = &route.location;

    if let Some(index) = &location.index {
        let index = dir.join(index);
        if fs::metadata(&index).await.is_ok_and(|m| m.is_file()) {
            return static_file(request, &index).await;
        }
    }

    if !location.autoindex {
        return Err(ErrorKind::PermissionDenied);
    }

    match request.method() {
        Method::Get => files::directory_listing(dir, request.path()).await,
        Method::Head => Ok(files::directory_listing(dir, request.path()).await?.without_body()),
        _ => Err(ErrorKind::MethodNotAllowed),
    }
}

async fn static_file(request: &ClientRequest, path: &Path) -> Result<Response, ErrorKind> {
    match request.method() {
        Method::Get => files::serve_file(path).await,
        Method::Head => Ok(files::serve_file(path).await?.without_body()),
        _ => Err(ErrorKind::MethodNotAllowed),
    }
}

fn with_query(path: &str, query: &str) -> String {
    match query.is_empty() {
        true => path.to_owned(),
        false => format!("{path}?{query}"),
    }
}
