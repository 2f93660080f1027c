//! Client authentication via the `X-Sentry-Auth` header.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::macros::impl_str_serde;

/// The latest protocol version supported on the store endpoint.
pub const MAX_PROTOCOL_VERSION: u16 = 8;

/// Raised if the auth header or query string cannot be parsed.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum AuthParseError {
    /// The auth header does not carry the `Sentry` prefix.
    #[error("missing auth scheme")]
    MissingScheme,
    /// The protocol version is missing or not an integer.
    #[error("invalid protocol version")]
    InvalidVersion,
    /// The public key is missing.
    #[error("missing public key in auth")]
    MissingPublicKey,
}

/// Parsed client authentication, from the `X-Sentry-Auth` header or the query string.
#[derive(Clone, Debug, PartialEq)]
pub struct Auth {
    version: u16,
    client: Option<String>,
    key: String,
    timestamp: Option<f64>,
}

impl_str_serde!(Auth, "an auth header string");

impl Auth {
    /// Parses authentication from `key=value` query string pairs.
    pub fn from_querystring(query: &str) -> Result<Auth, AuthParseError> {
        Self::from_pairs(query.split('&').filter_map(|pair| {
            let mut iter = pair.splitn(2, '=');
            Some((iter.next()?, iter.next().unwrap_or("")))
        }))
    }

    /// Constructs authentication from `sentry_*` key/value pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Auth, AuthParseError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut version = None;
        let mut client = None;
        let mut key = None;
        let mut timestamp = None;

        for (name, value) in pairs {
            let value = value.trim();
            match name.trim() {
                "sentry_version" => {
                    version = Some(
                        value
                            .parse::<u16>()
                            .map_err(|_| AuthParseError::InvalidVersion)?,
                    )
                }
                "sentry_client" => client = Some(value.to_owned()),
                "sentry_key" => key = Some(value.to_owned()),
                "sentry_timestamp" => timestamp = value.parse::<f64>().ok(),
                _ => (),
            }
        }

        Ok(Auth {
            version: version.ok_or(AuthParseError::InvalidVersion)?,
            client,
            key: key.ok_or(AuthParseError::MissingPublicKey)?,
            timestamp,
        })
    }

    /// Returns the protocol version the client speaks.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Returns the public key of the client.
    pub fn public_key(&self) -> &str {
        &self.key
    }

    /// Returns the client's agent string, if submitted.
    pub fn client_agent(&self) -> Option<&str> {
        self.client.as_deref()
    }

    /// Returns the unix timestamp the client defined, if submitted.
    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sentry sentry_version={}", self.version)?;
        if let Some(ts) = self.timestamp {
            write!(f, ", sentry_timestamp={ts}")?;
        }
        if let Some(ref client) = self.client {
            write!(f, ", sentry_client={client}")?;
        }
        write!(f, ", sentry_key={}", self.key)
    }
}

impl FromStr for Auth {
    type Err = AuthParseError;

    fn from_str(s: &str) -> Result<Auth, AuthParseError> {
        let rest = s
            .strip_prefix("Sentry")
            .or_else(|| s.strip_prefix("sentry"))
            .ok_or(AuthParseError::MissingScheme)?;

        Self::from_pairs(rest.split(',').filter_map(|pair| {
            let mut iter = pair.splitn(2, '=');
            Some((iter.next()?, iter.next()?))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let auth: Auth = "Sentry sentry_version=5, sentry_timestamp=1535376240291, \
             sentry_client=raven-node/2.6.3, sentry_key=31a5a894b4524f74a9a8d0e27e21ba91"
            .parse()
            .unwrap();

        assert_eq!(auth.version(), 5);
        assert_eq!(auth.public_key(), "31a5a894b4524f74a9a8d0e27e21ba91");
        assert_eq!(auth.client_agent(), Some("raven-node/2.6.3"));
        assert_eq!(auth.timestamp(), Some(1535376240291.0));
    }

    #[test]
    fn test_parse_querystring() {
        let auth =
            Auth::from_querystring("sentry_version=7&sentry_key=31a5a894b4524f74a9a8d0e27e21ba91")
                .unwrap();

        assert_eq!(auth.version(), 7);
        assert_eq!(auth.public_key(), "31a5a894b4524f74a9a8d0e27e21ba91");
        assert_eq!(auth.client_agent(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "Basic foo".parse::<Auth>().unwrap_err(),
            AuthParseError::MissingScheme
        );
        assert_eq!(
            "Sentry sentry_version=x, sentry_key=a".parse::<Auth>().unwrap_err(),
            AuthParseError::InvalidVersion
        );
        assert_eq!(
            "Sentry sentry_version=7".parse::<Auth>().unwrap_err(),
            AuthParseError::MissingPublicKey
        );
    }

    #[test]
    fn test_roundtrip_display() {
        let auth: Auth = "Sentry sentry_version=7, sentry_timestamp=1535376240291, \
             sentry_key=31a5a894b4524f74a9a8d0e27e21ba91"
            .parse()
            .unwrap();
        let reparsed: Auth = auth.to_string().parse().unwrap();
        assert_eq!(auth, reparsed);
    }
}
