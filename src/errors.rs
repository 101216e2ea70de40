use serde::Serialize;
use thiserror::Error;

/// Classification of a failed channel delivery.
///
/// Recorded to `envelope.metadata.lastDeliveryError` and surfaced over RPC
/// in the error `data` payload so callers can act on the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryErrorKind {
    NoBinding,
    AdapterNotLoaded,
    SendFailed,
}

impl DeliveryErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryErrorKind::NoBinding => "no-binding",
            DeliveryErrorKind::AdapterNotLoaded => "adapter-not-loaded",
            DeliveryErrorKind::SendFailed => "send-failed",
        }
    }
}

/// Details of a channel delivery failure.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    pub kind: DeliveryErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DeliveryFailure {
    pub fn new(kind: DeliveryErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            hint: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Typed error hierarchy for the daemon.
///
/// Core components return these at module boundaries; the RPC layer maps
/// each variant to a JSON-RPC error code exactly once. Leaf functions can
/// use `anyhow::Result`; the `Internal` variant converts via `?`.
#[derive(Debug, Error)]
pub enum HibossError {
    #[error("{0}")]
    Validation(String),

    #[error("Setup not complete")]
    SetupRequired,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("ambiguous {entity} id prefix '{prefix}' ({} matches)", candidates.len())]
    AmbiguousIdPrefix {
        entity: &'static str,
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("delivery failed: {}", .0.kind.as_str())]
    Delivery(DeliveryFailure),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type HibossResult<T> = std::result::Result<T, HibossError>;

impl HibossError {
    pub fn validation(msg: impl Into<String>) -> Self {
        HibossError::Validation(msg.into())
    }

    pub fn invalid_token() -> Self {
        HibossError::Unauthorized("Invalid token".to_string())
    }

    pub fn access_denied(operation: &str) -> Self {
        HibossError::Unauthorized(format!("Access denied for {}", operation))
    }

    /// The delivery failure carried by this error, if any.
    pub fn delivery_failure(&self) -> Option<&DeliveryFailure> {
        match self {
            HibossError::Delivery(f) => Some(f),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for HibossError {
    fn from(e: rusqlite::Error) -> Self {
        HibossError::Internal(e.into())
    }
}

impl From<serde_json::Error> for HibossError {
    fn from(e: serde_json::Error) -> Self {
        HibossError::Internal(e.into())
    }
}

impl From<std::io::Error> for HibossError {
    fn from(e: std::io::Error) -> Self {
        HibossError::Internal(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&DeliveryErrorKind::AdapterNotLoaded).unwrap();
        assert_eq!(json, "\"adapter-not-loaded\"");
    }

    #[test]
    fn ambiguous_prefix_display_includes_count() {
        let err = HibossError::AmbiguousIdPrefix {
            entity: "envelope",
            prefix: "4b7c2d1a".into(),
            candidates: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("2 matches"));
    }

    #[test]
    fn internal_from_anyhow() {
        let err: HibossError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, HibossError::Internal(_)));
    }

    #[test]
    fn delivery_failure_accessor() {
        let err = HibossError::Delivery(
            DeliveryFailure::new(DeliveryErrorKind::NoBinding).with_detail("telegram"),
        );
        let failure = err.delivery_failure().unwrap();
        assert_eq!(failure.kind, DeliveryErrorKind::NoBinding);
        assert!(err.to_string().contains("no-binding"));
    }
}
