//! Event-journal aggregation into minute/hour/day buckets.
//!
//! Minute buckets are computed from raw task/worker events; hourly
//! buckets roll up the minute table and daily buckets roll up the
//! hourly table, so a re-aggregated minute corrects the coarser tiers
//! on their next run. Writes are upserts keyed (endpoint, bucket):
//! re-aggregating a window is idempotent.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    stats::percentile, EndpointBucketStats, Granularity, TaskEventType, WorkerEventType,
    WorkerStatus,
};
use crate::domain::ports::{EventRepository, StatsRepository, WorkerRepository};

pub struct StatsAggregator {
    events: Arc<dyn EventRepository>,
    workers: Arc<dyn WorkerRepository>,
    stats: Arc<dyn StatsRepository>,
}

#[derive(Default)]
struct BucketAccumulator {
    submitted: u64,
    completed: u64,
    failed: u64,
    timeout: u64,
    retried: u64,
    queue_waits: Vec<i64>,
    executions: Vec<i64>,
    idle_spans: Vec<i64>,
    cold_starts: Vec<i64>,
    worker_ids: std::collections::BTreeSet<String>,
}

fn mean(samples: &[i64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<i64>() as f64 / samples.len() as f64)
    }
}

impl StatsAggregator {
    pub fn new(
        events: Arc<dyn EventRepository>,
        workers: Arc<dyn WorkerRepository>,
        stats: Arc<dyn StatsRepository>,
    ) -> Self {
        Self {
            events,
            workers,
            stats,
        }
    }

    /// Aggregate the closed buckets in the trailing window:
    /// `[truncate(now) - lookback, truncate(now))`.
    pub async fn aggregate_recent(
        &self,
        granularity: Granularity,
        lookback_buckets: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<usize> {
        let end = granularity.truncate(now);
        let start =
            end - chrono::Duration::seconds(granularity.seconds() * i64::from(lookback_buckets.max(1)));
        self.aggregate_range(granularity, start, end).await
    }

    /// Aggregate every bucket with data in `[start, end)`. Returns the
    /// number of rows written; empty buckets are skipped.
    #[instrument(skip(self))]
    pub async fn aggregate_range(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<usize> {
        let rows = match granularity.rollup_source() {
            Some(source) => self.rollup(granularity, source, start, end).await?,
            None => self.aggregate_events(granularity, start, end).await?,
        };

        let written = rows.len();
        for row in rows {
            self.stats.upsert_bucket(granularity, &row).await?;
        }
        debug!(granularity = granularity.as_str(), written, "aggregation pass done");
        Ok(written)
    }

    /// Minute-level aggregation straight from the event journal.
    async fn aggregate_events(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<EndpointBucketStats>> {
        let task_events = self.events.task_events_between(start, end).await?;
        let worker_events = self.events.worker_events_between(start, end).await?;

        let mut buckets: BTreeMap<(String, DateTime<Utc>), BucketAccumulator> = BTreeMap::new();

        for event in &task_events {
            let bucket = granularity.truncate(event.event_time);
            let acc = buckets
                .entry((event.endpoint.clone(), bucket))
                .or_default();
            match event.event_type {
                TaskEventType::TaskCreated => acc.submitted += 1,
                TaskEventType::TaskCompleted => acc.completed += 1,
                TaskEventType::TaskFailed => acc.failed += 1,
                TaskEventType::TaskTimeout => acc.timeout += 1,
                TaskEventType::TaskRequeued => acc.retried += 1,
                TaskEventType::TaskAssigned => {
                    if let Some(wait) = event.queue_wait_ms {
                        acc.queue_waits.push(wait);
                    }
                }
                _ => {}
            }
            if matches!(
                event.event_type,
                TaskEventType::TaskCompleted | TaskEventType::TaskFailed | TaskEventType::TaskTimeout
            ) {
                if let Some(execution) = event.execution_ms {
                    acc.executions.push(execution);
                }
            }
            if let Some(worker_id) = &event.worker_id {
                acc.worker_ids.insert(worker_id.clone());
            }
        }

        for event in &worker_events {
            let bucket = granularity.truncate(event.event_time);
            let bucket_start_ms = (event.event_time - bucket).num_milliseconds();
            let acc = buckets
                .entry((event.endpoint.clone(), bucket))
                .or_default();
            acc.worker_ids.insert(event.worker_id.clone());
            match event.event_type {
                WorkerEventType::WorkerTaskPulled => {
                    if let Some(idle) = event.idle_ms {
                        // An idle span straddling the boundary is
                        // clipped to this bucket's window.
                        acc.idle_spans.push(idle.min(bucket_start_ms).max(0));
                    }
                }
                WorkerEventType::WorkerRegistered => {
                    if let Some(cold) = event.cold_start_ms {
                        acc.cold_starts.push(cold);
                    }
                }
                _ => {}
            }
        }

        // Idle tail: workers still idle at a bucket's end contribute
        // the remainder of the window.
        let all_workers = self.workers.list_all().await?;
        for ((endpoint, bucket), acc) in &mut buckets {
            let bucket_end = granularity.bucket_end(*bucket);
            for worker in &all_workers {
                if worker.endpoint != *endpoint || worker.status != WorkerStatus::Online {
                    continue;
                }
                let Some(idle_since) = worker.last_task_time else {
                    continue;
                };
                if idle_since >= bucket_end {
                    continue;
                }
                let tail_start = idle_since.max(*bucket);
                let tail = (bucket_end - tail_start).num_milliseconds();
                if tail > 0 {
                    acc.idle_spans.push(tail);
                    acc.worker_ids.insert(worker.id.clone());
                }
            }
        }

        let bucket_ms = granularity.seconds() * 1000;
        Ok(buckets
            .into_iter()
            .map(|((endpoint, bucket), mut acc)| {
                acc.executions.sort_unstable();
                let busy_ms: i64 = acc.executions.iter().sum();
                let worker_utilization = if acc.worker_ids.is_empty() {
                    None
                } else {
                    let capacity_ms = bucket_ms * acc.worker_ids.len() as i64;
                    Some((busy_ms as f64 / capacity_ms as f64).min(1.0))
                };

                EndpointBucketStats {
                    endpoint,
                    bucket,
                    tasks_submitted: acc.submitted,
                    tasks_completed: acc.completed,
                    tasks_failed: acc.failed,
                    tasks_timeout: acc.timeout,
                    tasks_retried: acc.retried,
                    avg_queue_wait_ms: mean(&acc.queue_waits),
                    avg_execution_ms: mean(&acc.executions),
                    p50_execution_ms: percentile(&acc.executions, 50.0),
                    p95_execution_ms: percentile(&acc.executions, 95.0),
                    worker_utilization,
                    idle_ms_total: acc.idle_spans.iter().sum(),
                    idle_ms_max: acc.idle_spans.iter().copied().max().unwrap_or(0),
                    idle_ms_avg: mean(&acc.idle_spans),
                    cold_starts: acc.cold_starts.len() as u64,
                    cold_start_ms_avg: mean(&acc.cold_starts),
                }
            })
            .collect())
    }

    /// Roll finer buckets up into the target granularity.
    async fn rollup(
        &self,
        target: Granularity,
        source: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<EndpointBucketStats>> {
        let source_rows = self.stats.buckets_between(source, start, end).await?;

        let mut groups: BTreeMap<(String, DateTime<Utc>), Vec<EndpointBucketStats>> =
            BTreeMap::new();
        for row in source_rows {
            groups
                .entry((row.endpoint.clone(), target.truncate(row.bucket)))
                .or_default()
                .push(row);
        }

        Ok(groups
            .into_iter()
            .map(|((endpoint, bucket), rows)| combine_buckets(endpoint, bucket, &rows))
            .collect())
    }
}

/// Merge finer-grained rows into one coarser row. Sums are exact;
/// averages are weighted by their sample counts; p50 is sample-weighted
/// and p95 takes the worst source bucket.
fn combine_buckets(
    endpoint: String,
    bucket: DateTime<Utc>,
    rows: &[EndpointBucketStats],
) -> EndpointBucketStats {
    let mut out = EndpointBucketStats {
        endpoint,
        bucket,
        ..Default::default()
    };

    let mut queue_weight = 0u64;
    let mut queue_sum = 0.0;
    let mut exec_weight = 0u64;
    let mut exec_sum = 0.0;
    let mut p50_sum = 0.0;
    let mut util_count = 0u64;
    let mut util_sum = 0.0;
    let mut idle_count = 0u64;
    let mut cold_sum = 0.0;

    for row in rows {
        out.tasks_submitted += row.tasks_submitted;
        out.tasks_completed += row.tasks_completed;
        out.tasks_failed += row.tasks_failed;
        out.tasks_timeout += row.tasks_timeout;
        out.tasks_retried += row.tasks_retried;
        out.idle_ms_total += row.idle_ms_total;
        out.idle_ms_max = out.idle_ms_max.max(row.idle_ms_max);
        out.cold_starts += row.cold_starts;

        if let Some(avg) = row.avg_queue_wait_ms {
            queue_sum += avg * row.tasks_submitted as f64;
            queue_weight += row.tasks_submitted;
        }
        let terminal = row.tasks_completed + row.tasks_failed + row.tasks_timeout;
        if let Some(avg) = row.avg_execution_ms {
            exec_sum += avg * terminal as f64;
            exec_weight += terminal;
        }
        if let Some(p50) = row.p50_execution_ms {
            p50_sum += p50 as f64 * terminal as f64;
        }
        if let Some(p95) = row.p95_execution_ms {
            out.p95_execution_ms = Some(out.p95_execution_ms.unwrap_or(0).max(p95));
        }
        if let Some(util) = row.worker_utilization {
            util_sum += util;
            util_count += 1;
        }
        if row.idle_ms_avg.is_some() {
            idle_count += 1;
        }
        if let Some(avg) = row.cold_start_ms_avg {
            cold_sum += avg * row.cold_starts as f64;
        }
    }

    if queue_weight > 0 {
        out.avg_queue_wait_ms = Some(queue_sum / queue_weight as f64);
    }
    if exec_weight > 0 {
        out.avg_execution_ms = Some(exec_sum / exec_weight as f64);
        out.p50_execution_ms = Some((p50_sum / exec_weight as f64).round() as i64);
    }
    if util_count > 0 {
        out.worker_utilization = Some(util_sum / util_count as f64);
    }
    if idle_count > 0 {
        // Recovered from the totals: per-span counts are not carried
        // across tiers.
        let spans: i64 = rows.iter().map(|r| r.idle_ms_total).sum();
        if spans > 0 {
            out.idle_ms_avg = Some(spans as f64 / idle_count as f64);
        }
    }
    if out.cold_starts > 0 {
        out.cold_start_ms_avg = Some(cold_sum / out.cold_starts as f64);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket_at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 7, 14, minute, 0).unwrap()
    }

    fn row(minute: u32, completed: u64, avg_exec: f64) -> EndpointBucketStats {
        EndpointBucketStats {
            endpoint: "e1".into(),
            bucket: bucket_at(minute),
            tasks_submitted: completed,
            tasks_completed: completed,
            avg_execution_ms: Some(avg_exec),
            p50_execution_ms: Some(avg_exec as i64),
            p95_execution_ms: Some((avg_exec * 2.0) as i64),
            ..Default::default()
        }
    }

    #[test]
    fn test_combine_sums_and_weighted_averages() {
        let rows = vec![row(0, 2, 100.0), row(1, 6, 300.0)];
        let combined = combine_buckets(
            "e1".into(),
            Granularity::Hour.truncate(bucket_at(0)),
            &rows,
        );

        assert_eq!(combined.tasks_completed, 8);
        // (2*100 + 6*300) / 8 = 275
        assert_eq!(combined.avg_execution_ms, Some(275.0));
        // p95 takes the worst source bucket.
        assert_eq!(combined.p95_execution_ms, Some(600));
    }

    #[test]
    fn test_combine_empty_metrics_stay_none() {
        let rows = vec![EndpointBucketStats {
            endpoint: "e1".into(),
            bucket: bucket_at(0),
            tasks_submitted: 3,
            ..Default::default()
        }];
        let combined = combine_buckets("e1".into(), bucket_at(0), &rows);
        assert_eq!(combined.tasks_submitted, 3);
        assert!(combined.avg_execution_ms.is_none());
        assert!(combined.p95_execution_ms.is_none());
        assert!(combined.worker_utilization.is_none());
    }
}
