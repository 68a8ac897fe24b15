// ⚠️ Error types for the upload engine
//
// Store, configuration and plan problems are hard errors. Row-level
// problems (bad cells, ambiguous matches, rule violations) are NOT errors:
// they are captured in the UploadResult tree so the caller sees exactly
// which nested record failed.

use crate::rules::BusinessRuleException;
use thiserror::Error;

/// Common result type for the upload engine
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite operation error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error: plans, results, config files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upload plan does not fit the datamodel or the dataset
    #[error("Invalid upload plan: {0}")]
    Plan(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Raised by a RuleChecker; converted to FailedBusinessRule inside a row
    #[error("Business rule violation: {0}")]
    BusinessRule(#[from] BusinessRuleException),
}

impl Error {
    /// SQLite busy/locked conditions that are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
