//! Client identity and rate limit key generation.

use serde::Serialize;

/// Identity used when nothing about the client can be resolved.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The key used to partition rate limit state, typically the client IP.
///
/// Never empty: blank input collapses to [`UNKNOWN_CLIENT`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Create an identity from a raw value.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Self::unknown()
        } else if trimmed.len() == value.len() {
            Self(value)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// The sentinel identity for unresolvable clients.
    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a counter is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// One counter per client across all unconfigured routes
    Global,
    /// One counter per client for a configured route rule
    Route(String),
}

/// A key that uniquely identifies a counter store entry.
///
/// The key is composed of the store prefix, the scope and the client
/// identity, serialized in that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Namespace prefix in the counter store
    pub prefix: String,
    /// Route or global scope
    pub scope: RateLimitScope,
    /// The client this counter belongs to
    pub identity: ClientIdentity,
}

impl RateLimitKey {
    pub fn new(prefix: &str, scope: RateLimitScope, identity: &ClientIdentity) -> Self {
        Self {
            prefix: prefix.to_string(),
            scope,
            identity: identity.clone(),
        }
    }

    /// Convert the key to the string stored in the counter store.
    pub fn to_string_key(&self) -> String {
        match &self.scope {
            RateLimitScope::Global => format!("{}:global:{}", self.prefix, self.identity),
            RateLimitScope::Route(route) => {
                format!("{}:route:{}:{}", self.prefix, route, self.identity)
            }
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_never_empty() {
        assert_eq!(ClientIdentity::new("").as_str(), UNKNOWN_CLIENT);
        assert_eq!(ClientIdentity::new("   ").as_str(), UNKNOWN_CLIENT);
        assert_eq!(ClientIdentity::new(" 1.2.3.4 ").as_str(), "1.2.3.4");
    }

    #[test]
    fn test_global_key() {
        let identity = ClientIdentity::new("1.2.3.4");
        let key = RateLimitKey::new("ratelimit", RateLimitScope::Global, &identity);
        assert_eq!(key.to_string_key(), "ratelimit:global:1.2.3.4");
    }

    #[test]
    fn test_route_key() {
        let identity = ClientIdentity::new("1.2.3.4");
        let key = RateLimitKey::new(
            "rl",
            RateLimitScope::Route("/api/auth/login".to_string()),
            &identity,
        );
        assert_eq!(key.to_string(), "rl:route:/api/auth/login:1.2.3.4");
    }

    #[test]
    fn test_key_equality() {
        let identity = ClientIdentity::new("10.0.0.1");
        let key1 = RateLimitKey::new("rl", RateLimitScope::Global, &identity);
        let key2 = RateLimitKey::new("rl", RateLimitScope::Global, &identity);
        assert_eq!(key1, key2);
    }
}
