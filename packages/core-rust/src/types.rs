//! Identifier newtypes shared by the registry, the correlation store, and the wire layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport-level session identifier.
///
/// Supplied by the transport; the core never allocates one. Its closing is the
/// only trigger for bulk cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Parses a decimal connection identifier.
    ///
    /// Returns `None` for empty input, signs other than a leading `+`,
    /// trailing characters, or values outside the `u32` identifier space.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        raw.parse::<u32>().ok().map(Self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied request token. Opaque to the broker; echoed back on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle binding a provider's eventual result to one pending consumer context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Whether a provider result is a success or an error.
///
/// The broker routes both identically; only the payload content tells the
/// consumer which one it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Success,
    Error,
}

impl ResultKind {
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_parses_decimal() {
        assert_eq!(ConnectionId::parse("7"), Some(ConnectionId(7)));
        assert_eq!(ConnectionId::parse("0"), Some(ConnectionId(0)));
        assert_eq!(
            ConnectionId::parse("4294967295"),
            Some(ConnectionId(u32::MAX))
        );
    }

    #[test]
    fn connection_id_rejects_malformed() {
        assert_eq!(ConnectionId::parse(""), None);
        assert_eq!(ConnectionId::parse("-1"), None);
        assert_eq!(ConnectionId::parse("12abc"), None);
        assert_eq!(ConnectionId::parse(" 7"), None);
        assert_eq!(ConnectionId::parse("4294967296"), None);
    }

    #[test]
    fn correlation_id_serializes_as_plain_string() {
        let id = CorrelationId::from("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");
        let back: CorrelationId = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn result_kind_flags() {
        assert!(ResultKind::Error.is_error());
        assert!(!ResultKind::Success.is_error());
        assert_eq!(ResultKind::Success.as_str(), "success");
    }
}
