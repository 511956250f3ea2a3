//! EventSub endpoint URL handling
//!
//! Two entry points with different strictness:
//! - `validate` gates what the host may configure: `wss://` only
//! - `parse` splits an accepted URL into the pieces the resolver and
//!   handshake need, and understands a few more schemes

use std::fmt;

use url::{Host, ParseError, Url};

/// Schemes `parse` understands, with their default ports.
const KNOWN_SCHEMES: &[(&str, u16)] = &[("wss", 443), ("https", 443), ("http", 80), ("ftp", 21)];

const SCHEME_DELIMITER: &str = "://";

/// Host, port and request path of a parsed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Endpoint {
    /// Explicit port, or the scheme's well-known port.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| {
            KNOWN_SCHEMES
                .iter()
                .find(|(scheme, _)| *scheme == self.scheme)
                .map(|(_, port)| *port)
                .unwrap_or(443)
        })
    }

    /// `(host, path)` pair as used by the handshake request line.
    pub fn host_and_path(&self) -> (&str, &str) {
        (&self.host, &self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.path)
    }
}

/// Errors during URL parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    MissingScheme,
    UnsupportedScheme(String),
    MissingHost,
    InvalidHost(String),
    InvalidPort(String),
    /// Userinfo (`user:pass@`) in the authority
    Credentials,
}

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScheme => write!(f, "missing scheme delimiter '://'"),
            Self::UnsupportedScheme(s) => write!(f, "unsupported scheme: {}", s),
            Self::MissingHost => write!(f, "missing host"),
            Self::InvalidHost(h) => write!(f, "invalid host: {}", h),
            Self::InvalidPort(p) => write!(f, "invalid port: {}", p),
            Self::Credentials => write!(f, "url must not include username/password credentials"),
        }
    }
}

impl std::error::Error for UrlError {}

#[inline]
fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

/// True iff `url` is `wss://` + host (alphanumerics, dots, hyphens) +
/// optional `:port` + optional path or query.
pub fn validate(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("wss://") else {
        return false;
    };

    let host_len = rest.find(|c: char| !is_host_char(c)).unwrap_or(rest.len());
    if host_len == 0 {
        return false;
    }

    let mut tail = &rest[host_len..];
    if let Some(after_colon) = tail.strip_prefix(':') {
        let port_len = after_colon
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after_colon.len());
        if after_colon[..port_len].parse::<u16>().is_err() {
            return false;
        }
        tail = &after_colon[port_len..];
    }

    tail.is_empty() || tail.starts_with('/') || tail.starts_with('?')
}

/// Why `url` fails [`validate`], for error reporting.
pub fn rejection(url: &str) -> Option<UrlError> {
    if validate(url) {
        return None;
    }
    Some(match parse(url) {
        Err(e) => e,
        Ok(ep) if ep.scheme != "wss" => UrlError::UnsupportedScheme(ep.scheme),
        Ok(ep) => UrlError::InvalidHost(ep.host),
    })
}

/// Split `url` into an [`Endpoint`]. The path defaults to `/`; a query is
/// kept on the path as part of the request target.
pub fn parse(url: &str) -> Result<Endpoint, UrlError> {
    if !url.contains(SCHEME_DELIMITER) {
        return Err(UrlError::MissingScheme);
    }

    let parsed = Url::parse(url.trim()).map_err(|e| match e {
        ParseError::RelativeUrlWithoutBase => UrlError::MissingScheme,
        ParseError::EmptyHost => UrlError::MissingHost,
        ParseError::InvalidPort => UrlError::InvalidPort(url.to_string()),
        other => UrlError::InvalidHost(other.to_string()),
    })?;

    let scheme = parsed.scheme().to_string();
    if !KNOWN_SCHEMES.iter().any(|(known, _)| *known == scheme) {
        return Err(UrlError::UnsupportedScheme(scheme));
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(UrlError::Credentials);
    }

    let host = match parsed.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(UrlError::MissingHost),
    };

    let mut path = match parsed.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(Endpoint {
        scheme,
        host,
        port: parsed.port(),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_wss() {
        assert!(validate("wss://host.example.com/ws"));
        assert!(validate("wss://host:443/path?q=1"));
        assert!(validate("wss://eventsub.wss.twitch.tv/ws"));
        assert!(validate("wss://a-b.example"));
    }

    #[test]
    fn test_validate_rejects_other_schemes_and_bad_hosts() {
        assert!(!validate("ws://host"));
        assert!(!validate("https://host/ws"));
        assert!(!validate("wss://"));
        assert!(!validate("wss://bad_host/ws"));
        assert!(!validate("wss://host:notaport/ws"));
        assert!(!validate("wss://host:99999/ws"));
        assert!(!validate("wss://user@host/ws"));
        assert!(!validate(""));
    }

    #[test]
    fn test_parse_splits_host_and_path() {
        let ep = parse("wss://eventsub.example.com/ws").unwrap();
        assert_eq!(ep.host_and_path(), ("eventsub.example.com", "/ws"));
        assert_eq!(ep.port, None);
        assert_eq!(ep.port_or_default(), 443);
    }

    #[test]
    fn test_parse_defaults_path() {
        let ep = parse("wss://h.example.com").unwrap();
        assert_eq!(ep.host_and_path(), ("h.example.com", "/"));
    }

    #[test]
    fn test_parse_port_and_query() {
        let ep = parse("wss://host:8443/path?q=1").unwrap();
        assert_eq!(ep.host, "host");
        assert_eq!(ep.port, Some(8443));
        assert_eq!(ep.path, "/path?q=1");

        let ep = parse("wss://host?q=1").unwrap();
        assert_eq!(ep.path, "/?q=1");
    }

    #[test]
    fn test_parse_broader_schemes() {
        assert_eq!(parse("http://h/x").unwrap().port_or_default(), 80);
        assert_eq!(parse("ftp://h").unwrap().port_or_default(), 21);
        assert_eq!(parse("https://h").unwrap().port_or_default(), 443);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("notaurl"), Err(UrlError::MissingScheme));
        assert_eq!(
            parse("gopher://h/x"),
            Err(UrlError::UnsupportedScheme("gopher".to_string()))
        );
        assert_eq!(parse("wss://"), Err(UrlError::MissingHost));
        assert!(matches!(parse("wss://h:abc/ws"), Err(UrlError::InvalidPort(_))));
    }

    #[test]
    fn test_parse_rejects_credentials() {
        assert_eq!(
            parse("wss://user@host.example.com/ws"),
            Err(UrlError::Credentials)
        );
        assert_eq!(
            parse("wss://user:pw@host.example.com/ws"),
            Err(UrlError::Credentials)
        );
        assert_eq!(
            rejection("wss://user@host.example.com/ws"),
            Some(UrlError::Credentials)
        );
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let ep = parse("wss://[::1]/ws").unwrap();
        assert_eq!(ep.host_and_path(), ("::1", "/ws"));
        assert_eq!(ep.port_or_default(), 443);

        let ep = parse("wss://[::1]:9443/ws").unwrap();
        assert_eq!(ep.port, Some(9443));
        assert_eq!(ep.to_string(), "wss://[::1]:9443/ws");
    }

    #[test]
    fn test_parse_known_default_port_is_implicit() {
        let ep = parse("wss://host.example.com:443/ws").unwrap();
        assert_eq!(ep.port, None);
        assert_eq!(ep.port_or_default(), 443);
    }

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(rejection("wss://ok.example.com/ws"), None);
        assert_eq!(
            rejection("https://h/ws"),
            Some(UrlError::UnsupportedScheme("https".to_string()))
        );
        assert_eq!(
            rejection("wss://bad_host/ws"),
            Some(UrlError::InvalidHost("bad_host".to_string()))
        );
        assert_eq!(rejection("nope"), Some(UrlError::MissingScheme));
    }

    #[test]
    fn test_endpoint_display_round_trips_input() {
        let url = "wss://host:8443/ws";
        assert_eq!(parse(url).unwrap().to_string(), url);
    }
}
