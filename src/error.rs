//! Error taxonomy shared by every component.
//!
//! Plumbing returns `anyhow::Result`; domain failures are raised as `MemoryError`
//! and recovered by downcast when a caller needs the stable kind tag.

use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

const CORRUPT_HINT: &str =
    "memory.db looks corrupted: restore it from a backup or delete it and run `taskwing bootstrap`";

/// Failure class of an external call (LLM, embedder, reranker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalClass {
    Network,
    Timeout,
    Server,
    RateLimited,
    Client,
    Protocol,
}

impl ExternalClass {
    /// Transient classes are retried by `providers::retry`.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Server | Self::RateLimited
        )
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::Server),
            _ => Some(Self::Client),
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("{0}")]
    Validation(String),

    #[error("dependency cycle would be introduced: {}", path.join(" -> "))]
    CycleWould { path: Vec<String> },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("storage error: {message}")]
    Storage {
        message: String,
        hint: Option<String>,
    },

    #[error("memory.db schema v{found} is newer than the supported v{supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("{service} call failed ({class:?}): {message}")]
    External {
        service: &'static str,
        class: ExternalClass,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl MemoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn external(service: &'static str, class: ExternalClass, msg: impl Into<String>) -> Self {
        Self::External {
            service,
            class,
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::CycleWould { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StorageFull(_) | Self::Storage { .. } | Self::SchemaTooNew { .. } => {
                ErrorKind::Storage
            }
            Self::External { .. } => ErrorKind::External,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Storage { hint, .. } => hint.clone(),
            Self::StorageFull(_) => Some("free disk space and retry; nothing was written".into()),
            Self::SchemaTooNew { .. } => {
                Some("upgrade taskwing to a version that knows this schema".into())
            }
            Self::NotFound { what: "plan", .. } => Some("create or activate a plan first".into()),
            Self::External { .. } => Some("check the provider settings under [providers]".into()),
            _ => None,
        }
    }
}

/// Stable kind tag surfaced to `--json` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Storage,
    External,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Storage => "storage",
            Self::External => "external",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Map a raw SQLite failure into the storage taxonomy.
pub fn from_sqlite(err: &rusqlite::Error) -> Option<MemoryError> {
    let rusqlite::Error::SqliteFailure(inner, msg) = err else {
        return None;
    };
    let message = msg.clone().unwrap_or_else(|| inner.to_string());
    match inner.code {
        ErrorCode::DiskFull => Some(MemoryError::StorageFull(message)),
        ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Some(MemoryError::Storage {
            message,
            hint: Some(CORRUPT_HINT.to_string()),
        }),
        _ => None,
    }
}

/// Walk the error chain and return the first domain error, if any.
pub fn domain_error(err: &anyhow::Error) -> Option<&MemoryError> {
    err.chain().find_map(|cause| cause.downcast_ref::<MemoryError>())
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(domain_error(err), Some(MemoryError::Cancelled))
}

pub fn classify(err: &anyhow::Error) -> ErrorKind {
    if let Some(domain) = domain_error(err) {
        return domain.kind();
    }
    for cause in err.chain() {
        if cause.downcast_ref::<rusqlite::Error>().is_some()
            || cause.downcast_ref::<std::io::Error>().is_some()
        {
            return ErrorKind::Storage;
        }
        if cause.downcast_ref::<serde_json::Error>().is_some()
            || cause.downcast_ref::<toml::de::Error>().is_some()
        {
            return ErrorKind::Validation;
        }
    }
    ErrorKind::Storage
}

/// `{ok:false, kind, message, hint?}` failure shape for `--json` callers.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let hint = domain_error(err).and_then(MemoryError::hint).or_else(|| {
            err.chain()
                .find_map(|c| c.downcast_ref::<rusqlite::Error>())
                .and_then(from_sqlite)
                .and_then(|e| e.hint())
        });
        Self {
            ok: false,
            kind: classify(err),
            message: format!("{err:#}"),
            hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_walks_context_chain() {
        let err = Err::<(), _>(MemoryError::not_found("feature", "abc"))
            .context("Failed to delete feature")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::NotFound);
    }

    #[test]
    fn cycle_is_a_validation_error() {
        let err = anyhow::Error::new(MemoryError::CycleWould {
            path: vec!["A".into(), "C".into(), "B".into(), "A".into()],
        });
        assert_eq!(classify(&err), ErrorKind::Validation);
        assert!(err.to_string().contains("A -> C -> B -> A"));
    }

    #[test]
    fn transient_classes() {
        assert!(ExternalClass::RateLimited.is_transient());
        assert!(ExternalClass::Server.is_transient());
        assert!(!ExternalClass::Client.is_transient());
        assert_eq!(ExternalClass::from_status(429), Some(ExternalClass::RateLimited));
        assert_eq!(ExternalClass::from_status(503), Some(ExternalClass::Server));
        assert_eq!(ExternalClass::from_status(404), Some(ExternalClass::Client));
        assert_eq!(ExternalClass::from_status(200), None);
    }

    #[test]
    fn envelope_carries_kind_and_hint() {
        let err = anyhow::Error::new(MemoryError::SchemaTooNew {
            found: 9,
            supported: 2,
        });
        let env = ErrorEnvelope::from_error(&err);
        assert!(!env.ok);
        assert_eq!(env.kind, ErrorKind::Storage);
        assert!(env.hint.is_some());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "storage");
    }
}
