//! Location rules, prefix matching and traversal-safe path resolution.

use crate::{errors::ErrorKind, Method, StatusCode};
use std::{
    collections::HashMap,
    fs, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

/// One `[[location]]` rule. Immutable once the configuration is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// URI prefix, always starting with `/`.
    pub path: String,
    /// Filesystem root the request path is appended to.
    pub root: String,
    pub methods: Vec<Method>,
    /// Body ceiling for this location, `None` falls back to the server one.
    pub max_body_size: Option<usize>,
    /// Answered on an exact path match instead of serving anything.
    pub redirect: Option<Redirect>,
    /// File extension (with the dot) -> interpreter program.
    pub cgi: HashMap<String, PathBuf>,
    pub index: Option<String>,
    pub autoindex: bool,
    pub upload_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub status: StatusCode,
    pub target: String,
}

impl Location {
    /// Bare location serving `root` for `GET` and `HEAD`.
    pub fn new(path: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            root: root.into(),
            methods: vec![Method::Get, Method::Head],
            max_body_size: None,
            redirect: None,
            cgi: HashMap::new(),
            index: None,
            autoindex: false,
            upload_dir: None,
        }
    }

    #[inline]
    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Value for the `Allow` header of a `405` response.
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Interpreter registered for the extension of `path`, if any.
    pub fn cgi_interpreter(&self, path: &Path) -> Option<&Path> {
        let ext = path.extension()?.to_str()?;
        self.cgi
            .iter()
            .find(|(key, _)| key.strip_prefix('.') == Some(ext))
            .map(|(_, interpreter)| interpreter.as_path())
    }

    fn matches(&self, uri: &str) -> Option<bool> {
        let rest = uri.strip_prefix(self.path.as_str())?;

        if rest.is_empty() {
            return Some(true);
        }
        match rest.starts_with('/') || self.path.ends_with('/') {
            true => Some(false),
            false => None,
        }
    }
}

/// Result of routing one request. Exactness belongs to the match, never to
/// the shared rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub location: Arc<Location>,
    /// The URI path equals the location path.
    pub exact: bool,
}

/// Returns the first location whose path is a prefix of `uri`.
///
/// `locations` must be ordered most specific first, as
/// [`Site`](crate::Site) keeps them. A prefix only counts when it ends on a
/// segment boundary: `/img` matches `/img` and `/img/a.png` but not
/// `/images`.
pub fn find_best_match(uri: &str, locations: &[Arc<Location>]) -> Option<RouteMatch> {
    locations.iter().find_map(|location| {
        location.matches(uri).map(|exact| RouteMatch {
            location: Arc::clone(location),
            exact,
        })
    })
}

/// Filesystem target of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    /// The URI path ended with `/`.
    pub trailing_slash: bool,
}

/// Maps a URI path to a canonical filesystem path under the location root.
///
/// The path is built as `root_prefix + root + uri_path` and canonicalized
/// afterwards, so `..` segments coming from the URI are collapsed before the
/// containment check. Paths that do not exist yet are normalized lexically
/// on top of their deepest existing ancestor.
pub fn resolve_path(
    root_prefix: &str,
    location: &Location,
    uri_path: &str,
) -> Result<ResolvedPath, ErrorKind> {
    let root = join_root(root_prefix, &location.root);
    let full = format!("{}/{}", root, uri_path.trim_start_matches('/'));

    let canonical_root = canonical(Path::new(&root))?;
    let resolved = canonical(Path::new(&full))?;

    if !resolved.starts_with(&canonical_root) {
        tracing::warn!(uri = uri_path, resolved = %resolved.display(), "path escapes the location root");
        return Err(ErrorKind::Traversal);
    }

    Ok(ResolvedPath {
        path: resolved,
        trailing_slash: uri_path.ends_with('/'),
    })
}

pub(crate) fn join_root(prefix: &str, root: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let root = root.trim_end_matches('/');

    match (prefix.is_empty(), root.starts_with('/')) {
        (true, _) => root.to_owned(),
        (false, true) => format!("{prefix}{root}"),
        (false, false) => format!("{prefix}/{root}"),
    }
}

fn canonical(path: &Path) -> Result<PathBuf, ErrorKind> {
    match fs::canonicalize(path) {
        Ok(path) => return Ok(path),
        Err(e) if is_missing(&e) => {}
        Err(e) => return Err(ErrorKind::from_fs(&e)),
    }

    let lexical = normalize(path)?;

    let mut rest = Vec::new();
    let mut existing = lexical.as_path();
    while let Some(parent) = existing.parent() {
        if let Some(name) = existing.file_name() {
            rest.push(name);
        }
        existing = parent;

        if let Ok(base) = fs::canonicalize(existing) {
            return Ok(rest.iter().rev().fold(base, |acc, name| acc.join(name)));
        }
    }

    Ok(lexical)
}

#[inline]
fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(20)
}

/// Absolute path with `.` and `..` collapsed without touching the disk.
/// `..` never climbs above the filesystem root.
fn normalize(path: &Path) -> Result<PathBuf, ErrorKind> {
    let absolute = match path.is_absolute() {
        true => path.to_path_buf(),
        false => std::env::current_dir()?.join(path),
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component)
            }
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
        }
    }

    Ok(out)
}
