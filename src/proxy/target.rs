//! The fixed upstream a proxy instance forwards to.

use std::fmt;

use http::Uri;
use rustls::pki_types::ServerName;
use url::{Host, Url};

use crate::{Error, Result};

/// Validated upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    url: Url,
    /// Host without IPv6 brackets, used for DNS/connect and SNI.
    host: String,
    port: u16,
    /// `host[:port]` exactly as given, used for the `Host` header.
    authority: String,
}

impl ProxyTarget {
    /// Parse and validate an `http://` or `https://` URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| Error::Config(format!("Invalid target URL '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Invalid target URL '{raw}': scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(Error::Config(format!("Invalid target URL '{raw}': missing host"))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Config(format!("Invalid target URL '{raw}': missing port")))?;
        let bracketed = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        let authority = match url.port() {
            Some(p) => format!("{bracketed}:{p}"),
            None => bracketed,
        };

        Ok(Self {
            url,
            host,
            port,
            authority,
        })
    }

    /// Whether the upstream is reached over TLS.
    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Host to connect to (no brackets around IPv6 literals).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port to connect to, defaulting per scheme.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host[:port]` as it appears in the URL.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Name presented in SNI and checked against the server certificate.
    pub fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Config(format!("Invalid TLS server name '{}': {e}", self.host)))
    }

    /// Origin-form request target for `request`: the target's path prefix
    /// joined with the request path, and both queries joined with `&`.
    pub fn origin_form(&self, request: &Uri) -> Result<Uri> {
        let path = single_joining_slash(self.url.path(), request.path());
        let query = match (self.url.query(), request.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_owned()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_owned()),
            _ => None,
        };

        let path_and_query = match query {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        path_and_query
            .parse::<Uri>()
            .map_err(|e| Error::UpstreamUnreachable(format!("Cannot build upstream URI: {e}")))
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.url, f)
    }
}

/// Join two path segments with exactly one `/` between them.
fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}
