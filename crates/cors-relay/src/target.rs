//! Target resolution: turn `/<absolute-url>` into the URL to forward to.

use std::fmt;

use url::Url;

use crate::error::ProxyError;

/// The destination of one relayed request, parsed from the inbound path.
///
/// Always an absolute `http`/`https` URL without userinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: Url,
}

impl Target {
    /// Resolve the target from an inbound path-and-query such as
    /// `/https://example.com/file.zip?token=abc`.
    ///
    /// A single leading `/` is stripped; the remainder must be an absolute
    /// URL with an `http` or `https` scheme.
    pub fn resolve(path_and_query: &str) -> Result<Self, ProxyError> {
        let raw = path_and_query.strip_prefix('/').unwrap_or(path_and_query);
        let mut url = Url::parse(raw)?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProxyError::UnsupportedScheme(url.scheme().to_string()));
        }

        // Credentials in the path would otherwise end up in logs and in the
        // upstream request line.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Hostname without port, used for header-rule matching.
    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Value for a synthesized `Host` header: hostname plus any explicit
    /// non-default port.
    pub fn host_header(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{port}", self.hostname()),
            None => self.hostname().to_string(),
        }
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.url.fragment()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
