use thiserror::Error;

/// Boundary error taxonomy.
///
/// Provider failures and malformed model output never reach callers as
/// errors (they degrade to fallback payloads); the variants here are
/// the categories that are allowed to surface as hard failures, plus
/// `Provider` for the internal hops that still want context.
#[derive(Debug, Error)]
pub enum QuestError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("provider failure: {0}")]
    Provider(String),
}

impl QuestError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
