//! TOML configuration loading.
//!
//! ```toml
//! listen = "127.0.0.1:8080"
//! root_prefix = "./www"
//! client_max_body_size = 1048576
//!
//! [[location]]
//! path = "/"
//! root = "/html"
//! methods = ["GET", "POST"]
//! index = "index.html"
//!
//! [[location]]
//! path = "/cgi-bin"
//! root = "/"
//! methods = ["GET", "POST"]
//! cgi = { ".py" = "/usr/bin/python3" }
//! upload_dir = "uploads"
//!
//! [[location]]
//! path = "/old"
//! root = "/html"
//! redirect = { code = 301, target = "/" }
//! ```

use crate::{
    errors::ConfigError,
    routing::{Location, Redirect},
    Method, StatusCode,
};
use serde::Deserialize;
use std::{collections::HashMap, fs, net::SocketAddr, path::Path, path::PathBuf, sync::Arc};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    listen: SocketAddr,
    #[serde(default)]
    root_prefix: String,
    client_max_body_size: Option<usize>,
    #[serde(default, rename = "location")]
    locations: Vec<RawLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLocation {
    path: String,
    root: String,
    #[serde(default = "default_methods")]
    methods: Vec<String>,
    index: Option<String>,
    #[serde(default)]
    autoindex: bool,
    max_body_size: Option<usize>,
    redirect: Option<RawRedirect>,
    #[serde(default)]
    cgi: HashMap<String, PathBuf>,
    upload_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRedirect {
    code: u16,
    target: String,
}

fn default_methods() -> Vec<String> {
    vec!["GET".into(), "HEAD".into()]
}

/// Everything the server needs to route requests, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Site {
    pub listen: SocketAddr,
    /// Prepended to every location root.
    pub root_prefix: String,
    /// Server-wide body ceiling, `None` means unlimited.
    pub max_body_size: Option<usize>,
    /// Ordered most specific first.
    pub locations: Vec<Arc<Location>>,
}

impl Site {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

        if raw.locations.is_empty() {
            return Err(ConfigError::Invalid("at least one [[location]] is required".into()));
        }

        let mut locations = raw
            .locations
            .into_iter()
            .map(Location::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        for (i, location) in locations.iter().enumerate() {
            if locations[..i].iter().any(|other| other.path == location.path) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate location {}",
                    location.path
                )));
            }
        }

        // Longest prefix first, so the first hit is the most specific
        locations.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));

        Ok(Self {
            listen: raw.listen,
            root_prefix: raw.root_prefix,
            max_body_size: raw.client_max_body_size,
            locations: locations.into_iter().map(Arc::new).collect(),
        })
    }

    /// Body ceiling governing requests routed to `location`.
    #[inline]
    pub fn body_ceiling(&self, location: &Location) -> Option<usize> {
        location.max_body_size.or(self.max_body_size)
    }
}

impl TryFrom<RawLocation> for Location {
    type Error = ConfigError;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        let invalid = |reason: String| ConfigError::Invalid(format!("location {}: {reason}", raw.path));

        if !raw.path.starts_with('/') {
            return Err(invalid("path must start with '/'".into()));
        }

        let methods = raw
            .methods
            .iter()
            .map(|m| Method::from_bytes(m.as_bytes()).map_err(|_| invalid(format!("unknown method {m}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let redirect = match raw.redirect {
            Some(RawRedirect { code, target }) => {
                let status = StatusCode::from_u16(code)
                    .filter(StatusCode::is_redirect)
                    .ok_or_else(|| invalid(format!("redirect code {code} is not a 3xx status")))?;
                Some(Redirect { status, target })
            }
            None => None,
        };

        if let Some(ext) = raw.cgi.keys().find(|ext| !ext.starts_with('.') || ext.len() < 2) {
            return Err(invalid(format!("cgi extension {ext:?} must look like \".py\"")));
        }

        Ok(Location {
            path: raw.path,
            root: raw.root,
            methods,
            max_body_size: raw.max_body_size,
            redirect,
            cgi: raw.cgi,
            index: raw.index,
            autoindex: raw.autoindex,
            upload_dir: raw.upload_dir,
        })
    }
}
