//! Shared row-decoding helpers for the sqlite repositories.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

pub(crate) fn parse_datetime(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::SerializationError(format!("invalid timestamp '{s}': {e}")))
}

pub(crate) fn parse_opt_datetime(s: Option<&str>) -> DomainResult<Option<DateTime<Utc>>> {
    s.map(parse_datetime).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| DomainError::SerializationError(format!("invalid uuid '{s}': {e}")))
}
