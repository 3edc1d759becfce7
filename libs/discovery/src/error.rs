/// Errors reported by a coordination store client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unreachable: {0}")]
    Unreachable(String),

    #[error("lease {0} not found or expired")]
    LeaseNotFound(i64),

    #[error("watch stream closed: {0}")]
    WatchClosed(String),

    #[error("store client is closed")]
    Closed,

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Connectivity failures that a reconnect may cure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::WatchClosed(_) | Self::Closed)
    }
}

/// Errors surfaced by the registrar and the resolver.
///
/// Only construction-time failures ever reach a caller. Everything that happens inside
/// the background loops is handled there and only shows up in the logs.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid instance address '{0}'")]
    InvalidAddress(String),

    #[error("coordination store unreachable during {operation}: {source}")]
    StoreUnreachable {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("lease grant failed: {0}")]
    LeaseGrantFailed(#[source] StoreError),

    #[error("lease {0} expired or was revoked by the store")]
    LeaseExpired(i64),

    #[error("watch stream closed: {0}")]
    WatchStreamClosed(String),

    #[error("cannot decode instance address from key '{0}'")]
    KeyDecode(String),
}

impl DiscoveryError {
    pub(crate) fn unreachable(operation: &'static str, source: StoreError) -> Self {
        Self::StoreUnreachable { operation, source }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unreachable("dial".to_owned()).is_transient());
        assert!(StoreError::Closed.is_transient());
        assert!(!StoreError::LeaseNotFound(7).is_transient());
        assert!(!StoreError::Backend("boom".to_owned()).is_transient());
    }

    #[test]
    fn store_unreachable_keeps_source() {
        let err = DiscoveryError::unreachable("grant", StoreError::Unreachable("refused".to_owned()));
        let msg = err.to_string();
        assert!(msg.contains("grant"), "{msg}");
        assert!(std::error::Error::source(&err).is_some());
    }
}
