//! Client key derivation.

use std::net::IpAddr;

/// Key used when a request carries neither a credential nor a peer address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The identity under which rate limit state is partitioned.
///
/// Any string is accepted; the key is never validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Derive a key from the request's API credential, falling back to the
    /// peer address and then to [`UNKNOWN_CLIENT`].
    pub fn from_parts(api_key: Option<&str>, peer: Option<IpAddr>) -> Self {
        match (api_key.filter(|k| !k.is_empty()), peer) {
            (Some(api_key), _) => Self(api_key.to_string()),
            (None, Some(ip)) => Self(ip.to_string()),
            (None, None) => Self(UNKNOWN_CLIENT.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
