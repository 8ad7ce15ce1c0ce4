//! Statistics repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    CountScope, EndpointBucketStats, Granularity, TaskStatistics, TaskStatus,
};

/// Persistence for the incrementally-maintained task counts and the
/// bucketed aggregates.
#[async_trait]
pub trait StatsRepository: Send + Sync {
    /// Apply one status transition to both the global row and the
    /// endpoint row: decrement `from` (when Some), increment `to`.
    async fn increment_transition(
        &self,
        endpoint: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
    ) -> DomainResult<()>;

    /// Current counts for one scope.
    async fn get_counts(&self, scope: CountScope, scope_value: &str)
        -> DomainResult<TaskStatistics>;

    /// Replace all count rows with freshly recomputed values, in one
    /// transaction.
    async fn replace_counts(
        &self,
        global: &TaskStatistics,
        per_endpoint: &[TaskStatistics],
    ) -> DomainResult<()>;

    /// Write one aggregate row; re-aggregating a bucket overwrites it.
    async fn upsert_bucket(
        &self,
        granularity: Granularity,
        stats: &EndpointBucketStats,
    ) -> DomainResult<()>;

    /// Read one aggregate row.
    async fn get_bucket(
        &self,
        granularity: Granularity,
        endpoint: &str,
        bucket: DateTime<Utc>,
    ) -> DomainResult<Option<EndpointBucketStats>>;

    /// Aggregate rows with `start <= bucket < end`, every endpoint
    /// (rollup input).
    async fn buckets_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<EndpointBucketStats>>;
}
