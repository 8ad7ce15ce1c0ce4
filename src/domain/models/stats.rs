//! Statistics rows: incrementally-maintained task counts and bucketed
//! aggregates produced from the event journal.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Scope of a task-count row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountScope {
    /// Fleet-wide totals; `scope_value` is the empty string
    Global,
    /// Per-endpoint totals; `scope_value` is the endpoint name
    Endpoint,
}

impl CountScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Endpoint => "endpoint",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "endpoint" => Some(Self::Endpoint),
            _ => None,
        }
    }
}

/// Per-status task counts for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub scope_value: String,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskStatistics {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }
}

/// Aggregation resolution for event buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Bucket length in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3600,
            Self::Day => 86_400,
        }
    }

    /// Truncate a timestamp down to the start of its bucket.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let t = t.with_nanosecond(0).unwrap_or(t);
        match self {
            Self::Minute => t.with_second(0).unwrap_or(t),
            Self::Hour => t.with_second(0).and_then(|t| t.with_minute(0)).unwrap_or(t),
            Self::Day => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                .single()
                .unwrap_or(t),
        }
    }

    /// End of the bucket containing `t` (exclusive).
    pub fn bucket_end(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start + chrono::Duration::seconds(self.seconds())
    }

    /// The finer granularity this one rolls up, if any.
    pub fn rollup_source(&self) -> Option<Granularity> {
        match self {
            Self::Minute => None,
            Self::Hour => Some(Self::Minute),
            Self::Day => Some(Self::Hour),
        }
    }
}

/// One aggregated row per (endpoint, bucket).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointBucketStats {
    pub endpoint: String,
    pub bucket: DateTime<Utc>,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timeout: u64,
    pub tasks_retried: u64,
    pub avg_queue_wait_ms: Option<f64>,
    pub avg_execution_ms: Option<f64>,
    pub p50_execution_ms: Option<i64>,
    pub p95_execution_ms: Option<i64>,
    /// Busy time / wall time across workers active in the bucket
    pub worker_utilization: Option<f64>,
    pub idle_ms_total: i64,
    pub idle_ms_max: i64,
    pub idle_ms_avg: Option<f64>,
    pub cold_starts: u64,
    pub cold_start_ms_avg: Option<f64>,
}

/// Percentile over a sorted slice using nearest-rank.
///
/// `pct` in (0, 100]; returns None for an empty slice.
pub fn percentile(sorted: &[i64], pct: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_minute() {
        let t = Utc.with_ymd_and_hms(2025, 3, 7, 14, 35, 42).unwrap();
        let b = Granularity::Minute.truncate(t);
        assert_eq!(b, Utc.with_ymd_and_hms(2025, 3, 7, 14, 35, 0).unwrap());
    }

    #[test]
    fn test_truncate_hour_and_day() {
        let t = Utc.with_ymd_and_hms(2025, 3, 7, 14, 35, 42).unwrap();
        assert_eq!(
            Granularity::Hour.truncate(t),
            Utc.with_ymd_and_hms(2025, 3, 7, 14, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Day.truncate(t),
            Utc.with_ymd_and_hms(2025, 3, 7, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bucket_end() {
        let b = Utc.with_ymd_and_hms(2025, 3, 7, 14, 35, 0).unwrap();
        assert_eq!(
            Granularity::Minute.bucket_end(b),
            Utc.with_ymd_and_hms(2025, 3, 7, 14, 36, 0).unwrap()
        );
    }

    #[test]
    fn test_rollup_chain() {
        assert_eq!(Granularity::Minute.rollup_source(), None);
        assert_eq!(Granularity::Hour.rollup_source(), Some(Granularity::Minute));
        assert_eq!(Granularity::Day.rollup_source(), Some(Granularity::Hour));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let data = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile(&data, 50.0), Some(50));
        assert_eq!(percentile(&data, 95.0), Some(100));
        assert_eq!(percentile(&data, 100.0), Some(100));
        assert_eq!(percentile(&[42], 50.0), Some(42));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_statistics_total() {
        let stats = TaskStatistics {
            scope_value: "e1".into(),
            pending: 3,
            in_progress: 2,
            completed: 10,
            failed: 1,
            cancelled: 4,
        };
        assert_eq!(stats.total(), 20);
        assert_eq!(stats.get(TaskStatus::Completed), 10);
    }
}
