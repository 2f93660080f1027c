use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use url::Url;

/// Indicates failures in parsing an [`UpstreamDescriptor`].
#[derive(Debug, thiserror::Error)]
pub enum UpstreamParseError {
    /// The upstream URL is not valid.
    #[error("invalid upstream URL: bad URL format")]
    BadUrl,
    /// The upstream URL contains a path, query string or fragment.
    #[error("invalid upstream URL: must not have any path, query or fragment")]
    NonOriginUrl,
    /// The upstream URL uses an unsupported scheme.
    #[error("invalid upstream URL: unknown or unsupported URL scheme")]
    UnknownScheme,
    /// The upstream URL is missing a host name.
    #[error("invalid upstream URL: no host was provided")]
    NoHost,
}

/// The protocol scheme of an upstream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    /// Unencrypted HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// Returns the default port for this scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// Returns the string representation of the scheme.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The upstream target is a type that holds all the information to uniquely identify an upstream
/// target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpstreamDescriptor<'a> {
    host: Cow<'a, str>,
    port: u16,
    scheme: Scheme,
}

impl<'a> UpstreamDescriptor<'a> {
    /// Manually constructs an upstream descriptor.
    pub fn new(host: &'a str, port: u16, scheme: Scheme) -> Self {
        UpstreamDescriptor {
            host: Cow::Borrowed(host),
            port,
            scheme,
        }
    }

    /// Returns the host as a string.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the upstream port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the scheme of the upstream.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Returns a fully qualified URL for a path on this upstream.
    pub fn get_url(&self, path: &str) -> Url {
        format!("{}{}", self, path.trim_start_matches('/'))
            .parse()
            .expect("should be a valid url")
    }

    /// Returns an owned version of this descriptor.
    pub fn into_owned(self) -> UpstreamDescriptor<'static> {
        UpstreamDescriptor {
            host: Cow::Owned(self.host.into_owned()),
            port: self.port,
            scheme: self.scheme,
        }
    }
}

impl Default for UpstreamDescriptor<'_> {
    fn default() -> Self {
        UpstreamDescriptor {
            host: Cow::Borrowed("ingest.example.com"),
            port: 443,
            scheme: Scheme::Https,
        }
    }
}

impl fmt::Display for UpstreamDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if self.port != self.scheme.default_port() {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "/")
    }
}

impl FromStr for UpstreamDescriptor<'static> {
    type Err = UpstreamParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|_| UpstreamParseError::BadUrl)?;
        if url.path() != "/" || !(url.query().is_none() || url.query() == Some("")) {
            return Err(UpstreamParseError::NonOriginUrl);
        }

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(UpstreamParseError::UnknownScheme),
        };

        Ok(UpstreamDescriptor {
            host: match url.host_str() {
                Some(host) => Cow::Owned(host.to_owned()),
                None => return Err(UpstreamParseError::NoHost),
            },
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            scheme,
        })
    }
}

relay_common::impl_str_serde!(UpstreamDescriptor<'static>, "an upstream descriptor");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_parsing() {
        let desc: UpstreamDescriptor<'_> = "https://ingest.example.com/".parse().unwrap();
        assert_eq!(desc.host(), "ingest.example.com");
        assert_eq!(desc.port(), 443);
        assert_eq!(desc.scheme(), Scheme::Https);
    }

    #[test]
    fn test_custom_port() {
        let desc: UpstreamDescriptor<'_> = "http://localhost:8000/".parse().unwrap();
        assert_eq!(desc.host(), "localhost");
        assert_eq!(desc.port(), 8000);
        assert_eq!(desc.scheme(), Scheme::Http);
        assert_eq!(desc.to_string(), "http://localhost:8000/");
    }

    #[test]
    fn test_rejects_non_origin_urls() {
        assert!("https://example.com/path/".parse::<UpstreamDescriptor<'_>>().is_err());
        assert!("https://example.com/?query=1".parse::<UpstreamDescriptor<'_>>().is_err());
        assert!("ftp://example.com/".parse::<UpstreamDescriptor<'_>>().is_err());
    }

    #[test]
    fn test_get_url() {
        let desc: UpstreamDescriptor<'_> = "http://localhost:8000/".parse().unwrap();
        let url = desc.get_url("/api/42/store/");
        assert_eq!(url.as_str(), "http://localhost:8000/api/42/store/");
    }

    #[test]
    fn test_default_port_omitted_in_display() {
        let desc: UpstreamDescriptor<'_> = "https://ingest.example.com:443/".parse().unwrap();
        assert_eq!(desc.to_string(), "https://ingest.example.com/");
    }
}
