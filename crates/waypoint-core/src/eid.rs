//! Endpoint identifiers and patterns
//!
//! A DTN endpoint identifier is a URI. Two schemes are supported: the
//! string scheme `dtn:` (`dtn://node/app`, plus the reserved null endpoint
//! `dtn:none`) and the numeric scheme `ipn:` (`ipn:<node>.<service>`).
//!
//! [`EidPattern`] adds a trailing `*` wildcard over the same syntax and is
//! what registrations and route entries match against.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reserved null endpoint
pub const NULL_EID: &str = "dtn:none";

/// Errors from endpoint id / pattern parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EidError {
    /// The string has no `scheme:` prefix
    #[error("endpoint id has no scheme: '{0}'")]
    MissingScheme(String),

    /// The scheme is not one we know how to route on
    #[error("unsupported endpoint scheme: '{0}'")]
    UnsupportedScheme(String),

    /// The scheme-specific part is empty or malformed
    #[error("invalid scheme-specific part: '{0}'")]
    InvalidSsp(String),

    /// An `ipn:` ssp that is not `<node>.<service>`
    #[error("invalid ipn endpoint: '{0}'")]
    InvalidIpn(String),

    /// A `*` appears anywhere but the end of a pattern
    #[error("wildcard must be the final character: '{0}'")]
    BadWildcard(String),
}

/// A DTN endpoint identifier
///
/// Stored as the full URI string; accessors split out the scheme and
/// scheme-specific parts. Ordering and hashing are by the URI string so
/// the type can key maps directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId {
    uri: String,
}

impl EndpointId {
    /// Parse an endpoint id, validating scheme and ssp
    pub fn parse(s: &str) -> Result<Self, EidError> {
        let (scheme, ssp) = s
            .split_once(':')
            .ok_or_else(|| EidError::MissingScheme(s.to_string()))?;

        match scheme {
            "dtn" => {
                if ssp.is_empty() {
                    return Err(EidError::InvalidSsp(s.to_string()));
                }
                if ssp != "none" && !ssp.starts_with("//") {
                    return Err(EidError::InvalidSsp(s.to_string()));
                }
            }
            "ipn" => {
                parse_ipn_ssp(ssp).ok_or_else(|| EidError::InvalidIpn(s.to_string()))?;
            }
            other => return Err(EidError::UnsupportedScheme(other.to_string())),
        }

        Ok(Self { uri: s.to_string() })
    }

    /// Assemble from separate scheme and ssp strings (dictionary decode path)
    pub fn from_parts(scheme: &str, ssp: &str) -> Result<Self, EidError> {
        Self::parse(&format!("{scheme}:{ssp}"))
    }

    /// The null endpoint `dtn:none`
    pub fn null() -> Self {
        Self {
            uri: NULL_EID.to_string(),
        }
    }

    /// Build an `ipn:<node>.<service>` endpoint
    pub fn ipn(node: u64, service: u64) -> Self {
        Self {
            uri: format!("ipn:{node}.{service}"),
        }
    }

    /// The full URI string
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// The scheme part (before the colon)
    pub fn scheme(&self) -> &str {
        self.uri.split_once(':').map(|(s, _)| s).unwrap_or("")
    }

    /// The scheme-specific part (after the colon)
    pub fn ssp(&self) -> &str {
        self.uri.split_once(':').map(|(_, p)| p).unwrap_or("")
    }

    /// Whether this is the reserved null endpoint
    pub fn is_null(&self) -> bool {
        self.uri == NULL_EID
    }

    /// Whether this uses the numeric `ipn:` scheme
    pub fn is_ipn(&self) -> bool {
        self.scheme() == "ipn"
    }

    /// The `(node, service)` pair for `ipn:` endpoints
    pub fn ipn_parts(&self) -> Option<(u64, u64)> {
        if !self.is_ipn() {
            return None;
        }
        parse_ipn_ssp(self.ssp())
    }

    /// Derive a new endpoint by appending a service demux token
    ///
    /// Only meaningful for `dtn://` endpoints; returns an error otherwise.
    pub fn with_service(&self, service: &str) -> Result<Self, EidError> {
        if !self.ssp().starts_with("//") {
            return Err(EidError::InvalidSsp(self.uri.clone()));
        }
        let joined = if self.uri.ends_with('/') {
            format!("{}{service}", self.uri)
        } else {
            format!("{}/{service}", self.uri)
        };
        Self::parse(&joined)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl TryFrom<String> for EndpointId {
    type Error = EidError;

    fn try_from(s: String) -> Result<Self, EidError> {
        Self::parse(&s)
    }
}

impl From<EndpointId> for String {
    fn from(eid: EndpointId) -> String {
        eid.uri
    }
}

impl std::str::FromStr for EndpointId {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, EidError> {
        Self::parse(s)
    }
}

fn parse_ipn_ssp(ssp: &str) -> Option<(u64, u64)> {
    let (node, service) = ssp.split_once('.')?;
    Some((node.parse().ok()?, service.parse().ok()?))
}

/// An endpoint pattern: an endpoint id string, optionally ending in `*`
///
/// `dtn://relay/*` matches every endpoint under that node;
/// `ipn:12.*` matches every service on ipn node 12; a pattern with no
/// wildcard matches exactly one endpoint.
///
/// Patterns are ranked by [`specificity`](EidPattern::specificity) for
/// longest-match route selection: longer literal prefixes rank higher, and
/// an exact pattern outranks a wildcard of the same literal length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EidPattern {
    pattern: String,
}

impl EidPattern {
    /// Parse a pattern, validating wildcard placement
    pub fn parse(s: &str) -> Result<Self, EidError> {
        if s.is_empty() {
            return Err(EidError::MissingScheme(s.to_string()));
        }
        let stars = s.matches('*').count();
        match stars {
            0 => {
                // Exact pattern: must itself be a valid endpoint
                EndpointId::parse(s)?;
            }
            1 => {
                if !s.ends_with('*') {
                    return Err(EidError::BadWildcard(s.to_string()));
                }
                // The literal prefix still needs a recognizable scheme
                let prefix = &s[..s.len() - 1];
                let scheme = prefix
                    .split_once(':')
                    .map(|(sch, _)| sch)
                    .ok_or_else(|| EidError::MissingScheme(s.to_string()))?;
                if scheme != "dtn" && scheme != "ipn" {
                    return Err(EidError::UnsupportedScheme(scheme.to_string()));
                }
            }
            _ => return Err(EidError::BadWildcard(s.to_string())),
        }
        Ok(Self {
            pattern: s.to_string(),
        })
    }

    /// A pattern that matches exactly one endpoint
    pub fn exact(eid: &EndpointId) -> Self {
        Self {
            pattern: eid.as_str().to_string(),
        }
    }

    /// The pattern string
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern carries a wildcard
    pub fn is_wildcard(&self) -> bool {
        self.pattern.ends_with('*')
    }

    /// Whether this pattern matches the given endpoint
    pub fn matches(&self, eid: &EndpointId) -> bool {
        if let Some(prefix) = self.pattern.strip_suffix('*') {
            eid.as_str().starts_with(prefix)
        } else {
            eid.as_str() == self.pattern
        }
    }

    /// Rank for longest-match selection
    ///
    /// Twice the literal length, plus one for exact patterns, so that an
    /// exact pattern always outranks a wildcard with the same prefix.
    pub fn specificity(&self) -> usize {
        if let Some(prefix) = self.pattern.strip_suffix('*') {
            prefix.len() * 2
        } else {
            self.pattern.len() * 2 + 1
        }
    }
}

impl std::fmt::Display for EidPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl TryFrom<String> for EidPattern {
    type Error = EidError;

    fn try_from(s: String) -> Result<Self, EidError> {
        Self::parse(&s)
    }
}

impl From<EidPattern> for String {
    fn from(p: EidPattern) -> String {
        p.pattern
    }
}

impl std::str::FromStr for EidPattern {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, EidError> {
        Self::parse(s)
    }
}
