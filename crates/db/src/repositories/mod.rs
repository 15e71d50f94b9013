use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use expensa_core::errors::ApplicationError;
use expensa_core::workflow::StoreError;

pub mod directory;
pub mod expense;
pub mod rule;

pub use directory::SqlUserDirectory;
pub use expense::SqlExpenseStore;
pub use rule::SqlRuleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

/// Fixed-width UTC so stored timestamps sort lexically.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{column}: invalid timestamp `{raw}`: {e}")))
}

pub(crate) fn parse_date(column: &str, raw: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| RepositoryError::Decode(format!("{column}: invalid date `{raw}`: {e}")))
}

pub(crate) fn parse_decimal(column: &str, raw: &str) -> Result<Decimal, RepositoryError> {
    raw.parse::<Decimal>()
        .map_err(|e| RepositoryError::Decode(format!("{column}: invalid decimal `{raw}`: {e}")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>, RepositoryError> {
    raw.map(|json| {
        serde_json::from_str(&json)
            .map_err(|e| RepositoryError::Decode(format!("{column}: invalid json: {e}")))
    })
    .transpose()
}

pub(crate) fn encode_json<T: serde::Serialize>(
    column: &str,
    value: Option<&T>,
) -> Result<Option<String>, RepositoryError> {
    value
        .map(|inner| {
            serde_json::to_string(inner)
                .map_err(|e| RepositoryError::Decode(format!("{column}: encode failed: {e}")))
        })
        .transpose()
}
