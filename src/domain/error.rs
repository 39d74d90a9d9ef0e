//! Domain error types.

/// Top-level error type for tidemark.
#[derive(Debug, thiserror::Error)]
pub enum TidemarkError {
    #[error("upstream source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("object registry unavailable: {reason}")]
    RegistryUnavailable { reason: String },

    #[error("cache store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("object registry is full: need {needed} bytes, {available} of {capacity} available")]
    RegistryFull {
        needed: u64,
        available: u64,
        capacity: u64,
    },

    #[error("object {object_id} already exists in the registry")]
    ObjectExists { object_id: String },

    #[error("malformed cache key {key:?}: {reason}")]
    MalformedKey { key: String, reason: String },

    #[error("data integrity violation: {reason}")]
    Integrity { reason: String },

    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("interrupted by stop signal")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TidemarkError {
    /// Errors worth retrying on the next cycle without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TidemarkError::SourceUnavailable { .. }
                | TidemarkError::RegistryUnavailable { .. }
                | TidemarkError::StoreUnavailable { .. }
                | TidemarkError::ObjectExists { .. }
                | TidemarkError::Io(_)
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            TidemarkError::MalformedKey { .. }
                | TidemarkError::Integrity { .. }
                | TidemarkError::InvalidRange { .. }
        )
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        TidemarkError::StoreUnavailable {
            reason: err.to_string(),
        }
    }

    pub(crate) fn source(err: impl std::fmt::Display) -> Self {
        TidemarkError::SourceUnavailable {
            reason: err.to_string(),
        }
    }

    pub(crate) fn registry(err: impl std::fmt::Display) -> Self {
        TidemarkError::RegistryUnavailable {
            reason: err.to_string(),
        }
    }

    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        TidemarkError::Integrity {
            reason: reason.into(),
        }
    }
}

impl From<&TidemarkError> for std::process::ExitCode {
    fn from(err: &TidemarkError) -> Self {
        let code: u8 = match err {
            TidemarkError::Io(_) => 1,
            TidemarkError::ConfigParse { .. }
            | TidemarkError::ConfigMissing { .. }
            | TidemarkError::ConfigInvalid { .. } => 2,
            TidemarkError::SourceUnavailable { .. }
            | TidemarkError::RegistryUnavailable { .. }
            | TidemarkError::StoreUnavailable { .. }
            | TidemarkError::ObjectExists { .. } => 3,
            TidemarkError::MalformedKey { .. }
            | TidemarkError::Integrity { .. }
            | TidemarkError::InvalidRange { .. } => 4,
            TidemarkError::RegistryFull { .. } => 5,
            TidemarkError::Interrupted => 6,
        };
        std::process::ExitCode::from(code)
    }
}
