//! Static file bodies and directory listings.

use crate::{errors::ErrorKind, http::response::Response, StatusCode};
use std::{fmt::Write, path::Path};
use tokio::fs;

/// Media type guessed from the file extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Reads a regular file into a `200` response.
pub async fn serve_file(path: &Path) -> Result<Response, ErrorKind> {
    let body = fs::read(path).await.map_err(|e| ErrorKind::from_fs(&e))?;

    Ok(Response::status(StatusCode::Ok)
        .header("content-type", content_type(path))
        .body(body))
}

/// Renders an HTML index of `dir`. `uri_path` is the directory's request
/// path and ends with `/`.
pub async fn directory_listing(dir: &Path, uri_path: &str) -> Result<Response, ErrorKind> {
    let mut reader = fs::read_dir(dir).await.map_err(|e| ErrorKind::from_fs(&e))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| ErrorKind::from_fs(&e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata().await.ok();
        entries.push((name, meta));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let title = escape(uri_path);
    let mut html = String::with_capacity(512 + entries.len() * 96);
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Index of {title}</title>\n</head>\n<body>\n\
         <h1>Index of {title}</h1>\n<table>\n\
         <tr><th>Name</th><th>Type</th><th>Size</th></tr>\n"
    );

    if uri_path != "/" {
        html.push_str("<tr><td><a href=\"../\">../</a></td><td>Directory</td><td>-</td></tr>\n");
    }

    for (name, meta) in &entries {
        let name = escape(name);
        let (slash, kind, size) = match meta {
            Some(meta) if meta.is_dir() => ("/", "Directory", "-".to_owned()),
            Some(meta) if meta.is_file() => ("", "File", meta.len().to_string()),
            Some(_) => ("", "Other", "-".to_owned()),
            None => ("", "Unknown", "-".to_owned()),
        };

        let _ = writeln!(
            html,
            "<tr><td><a href=\"{name}{slash}\">{name}{slash}</a></td><td>{kind}</td><td>{size}</td></tr>"
        );
    }

    html.push_str("</table>\n</body>\n</html>\n");

    Ok(Response::status(StatusCode::Ok)
        .header("content-type", "text/html")
        .body(html))
}

fn escape(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod files_tests {
    use super::*;

    #[test]
    fn content_types() {
        #[rustfmt::skip]
        let cases = [
            ("index.html",   "text/html"),
            ("a/b/STYLE.CSS", "text/css"),
            ("app.js",       "application/javascript"),
            ("photo.JPEG",   "image/jpeg"),
            ("archive.zip",  "application/zip"),
            ("Makefile",     "application/octet-stream"),
            ("data.bin",     "application/octet-stream"),
        ];

        for (path, expected) in cases {
            assert_eq!(content_type(Path::new(path)), expected, "{path}");
        }
    }

    #[tokio::test]
    async fn file_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("<b>.html"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let response = serve_file(&dir.path().join("a.txt")).await.unwrap();
        assert_eq!(response.header_value("content-type"), Some("text/plain"));
        assert_eq!(response.body_bytes(), b"hello");

        assert_eq!(
            serve_file(&dir.path().join("missing")).await.unwrap_err(),
            ErrorKind::NotFound
        );

        let listing = directory_listing(dir.path(), "/files/").await.unwrap();
        let html = String::from_utf8(listing.body_bytes().to_vec()).unwrap();

        assert!(html.contains("<title>Index of /files/</title>"));
        assert!(html.contains("<a href=\"a.txt\">a.txt</a></td><td>File</td><td>5</td>"));
        assert!(html.contains("<a href=\"sub/\">sub/</a></td><td>Directory</td>"));
        assert!(html.contains("&lt;b&gt;.html"));
        assert!(html.contains("<a href=\"../\">"));
    }
}
