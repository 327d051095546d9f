//! Link URIs: `scheme://address`.

use std::fmt;
use std::str::FromStr;

use crate::LinkError;

/// A parsed link URI such as `udp://192.168.43.42:2390` or
/// `loopback://bench`.
///
/// Resolvers pick a driver by [`scheme`](Self::scheme) and hand the
/// [`address`](Self::address) to it uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkUri {
    scheme: String,
    address: String,
}

impl LinkUri {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl FromStr for LinkUri {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| LinkError::InvalidUri(s.to_string()))?;

        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok || address.is_empty() {
            return Err(LinkError::InvalidUri(s.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            address: address.to_string(),
        })
    }
}

impl fmt::Display for LinkUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}
