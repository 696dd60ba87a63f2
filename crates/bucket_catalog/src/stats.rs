//! Execution statistics for observability.
//!
//! One [`ExecutionStats`] exists per namespace plus one global aggregate;
//! every increment lands on both through an [`ExecutionStatsController`].
//! All counters are relaxed atomics: they are monotonic and only read for
//! reporting, so no ordering is needed beyond the increments themselves.

use std::sync::{
    atomic::{
        AtomicI64,
        Ordering,
    },
    Arc,
};

use value::Document;

#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub num_bucket_inserts: AtomicI64,
    pub num_bucket_updates: AtomicI64,
    pub num_buckets_opened_due_to_metadata: AtomicI64,
    pub num_buckets_closed_due_to_count: AtomicI64,
    pub num_buckets_closed_due_to_schema_change: AtomicI64,
    pub num_buckets_closed_due_to_size: AtomicI64,
    pub num_buckets_closed_due_to_time_forward: AtomicI64,
    pub num_buckets_closed_due_to_time_backward: AtomicI64,
    pub num_buckets_closed_due_to_memory_threshold: AtomicI64,
    pub num_buckets_archived_due_to_time_forward: AtomicI64,
    pub num_buckets_archived_due_to_time_backward: AtomicI64,
    pub num_buckets_archived_due_to_memory_threshold: AtomicI64,
    pub num_commits: AtomicI64,
    pub num_waits: AtomicI64,
    pub num_measurements_committed: AtomicI64,
    pub num_buckets_reopened: AtomicI64,
    pub num_buckets_kept_open_due_to_large_measurements: AtomicI64,
}

macro_rules! controller_increment {
    ( $( $method:ident => $counter:ident ),* $(,)? ) => {
        $(
            pub fn $method(&self) {
                self.collection_stats.$counter.fetch_add(1, Ordering::Relaxed);
                self.global_stats.$counter.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

/// Increments a namespace's stats and the global stats together.
#[derive(Clone)]
pub struct ExecutionStatsController {
    collection_stats: Arc<ExecutionStats>,
    global_stats: Arc<ExecutionStats>,
}

impl ExecutionStatsController {
    pub(crate) fn new(
        collection_stats: Arc<ExecutionStats>,
        global_stats: Arc<ExecutionStats>,
    ) -> Self {
        Self {
            collection_stats,
            global_stats,
        }
    }

    controller_increment!(
        inc_num_bucket_inserts => num_bucket_inserts,
        inc_num_bucket_updates => num_bucket_updates,
        inc_num_buckets_opened_due_to_metadata => num_buckets_opened_due_to_metadata,
        inc_num_buckets_closed_due_to_count => num_buckets_closed_due_to_count,
        inc_num_buckets_closed_due_to_schema_change => num_buckets_closed_due_to_schema_change,
        inc_num_buckets_closed_due_to_size => num_buckets_closed_due_to_size,
        inc_num_buckets_closed_due_to_time_forward => num_buckets_closed_due_to_time_forward,
        inc_num_buckets_closed_due_to_time_backward => num_buckets_closed_due_to_time_backward,
        inc_num_buckets_closed_due_to_memory_threshold => num_buckets_closed_due_to_memory_threshold,
        inc_num_buckets_archived_due_to_time_forward => num_buckets_archived_due_to_time_forward,
        inc_num_buckets_archived_due_to_time_backward => num_buckets_archived_due_to_time_backward,
        inc_num_buckets_archived_due_to_memory_threshold => num_buckets_archived_due_to_memory_threshold,
        inc_num_commits => num_commits,
        inc_num_waits => num_waits,
        inc_num_buckets_reopened => num_buckets_reopened,
        inc_num_buckets_kept_open_due_to_large_measurements => num_buckets_kept_open_due_to_large_measurements,
    );

    pub fn inc_num_measurements_committed(&self, increment: i64) {
        self.collection_stats
            .num_measurements_committed
            .fetch_add(increment, Ordering::Relaxed);
        self.global_stats
            .num_measurements_committed
            .fetch_add(increment, Ordering::Relaxed);
    }
}

/// Serialize a stats block into a builder document. Archival and reopen
/// counters only exist when the scalability improvements are enabled.
pub(crate) fn append_execution_stats_to_builder(
    stats: &ExecutionStats,
    builder: &mut Document,
    scalability_enabled: bool,
) {
    let mut append = |name: &str, value: i64| {
        builder.append(name.parse().expect("stat names are valid field names"), value);
    };
    append("numBucketInserts", stats.num_bucket_inserts.load(Ordering::Relaxed));
    append("numBucketUpdates", stats.num_bucket_updates.load(Ordering::Relaxed));
    append(
        "numBucketsOpenedDueToMetadata",
        stats.num_buckets_opened_due_to_metadata.load(Ordering::Relaxed),
    );
    append(
        "numBucketsClosedDueToCount",
        stats.num_buckets_closed_due_to_count.load(Ordering::Relaxed),
    );
    append(
        "numBucketsClosedDueToSchemaChange",
        stats.num_buckets_closed_due_to_schema_change.load(Ordering::Relaxed),
    );
    append(
        "numBucketsClosedDueToSize",
        stats.num_buckets_closed_due_to_size.load(Ordering::Relaxed),
    );
    append(
        "numBucketsClosedDueToTimeForward",
        stats.num_buckets_closed_due_to_time_forward.load(Ordering::Relaxed),
    );
    append(
        "numBucketsClosedDueToTimeBackward",
        stats.num_buckets_closed_due_to_time_backward.load(Ordering::Relaxed),
    );
    append(
        "numBucketsClosedDueToMemoryThreshold",
        stats.num_buckets_closed_due_to_memory_threshold.load(Ordering::Relaxed),
    );

    let commits = stats.num_commits.load(Ordering::Relaxed);
    append("numCommits", commits);
    append("numWaits", stats.num_waits.load(Ordering::Relaxed));
    let measurements_committed = stats.num_measurements_committed.load(Ordering::Relaxed);
    append("numMeasurementsCommitted", measurements_committed);
    if commits != 0 {
        append("avgNumMeasurementsPerCommit", measurements_committed / commits);
    }

    if scalability_enabled {
        append(
            "numBucketsArchivedDueToTimeForward",
            stats.num_buckets_archived_due_to_time_forward.load(Ordering::Relaxed),
        );
        append(
            "numBucketsArchivedDueToTimeBackward",
            stats.num_buckets_archived_due_to_time_backward.load(Ordering::Relaxed),
        );
        append(
            "numBucketsArchivedDueToMemoryThreshold",
            stats
                .num_buckets_archived_due_to_memory_threshold
                .load(Ordering::Relaxed),
        );
        append("numBucketsReopened", stats.num_buckets_reopened.load(Ordering::Relaxed));
        append(
            "numBucketsKeptOpenDueToLargeMeasurements",
            stats
                .num_buckets_kept_open_due_to_large_measurements
                .load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use value::{
        Document,
        Value,
    };

    use super::{
        append_execution_stats_to_builder,
        ExecutionStats,
        ExecutionStatsController,
    };

    #[test]
    fn test_controller_bumps_both_blocks() {
        let collection = Arc::new(ExecutionStats::default());
        let global = Arc::new(ExecutionStats::default());
        let controller = ExecutionStatsController::new(collection.clone(), global.clone());
        controller.inc_num_commits();
        controller.inc_num_measurements_committed(3);
        assert_eq!(collection.num_commits.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(global.num_commits.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(
            global
                .num_measurements_committed
                .load(std::sync::atomic::Ordering::Relaxed),
            3
        );
    }

    #[test]
    fn test_average_only_when_commits_exist() {
        let stats = ExecutionStats::default();
        let mut builder = Document::new();
        append_execution_stats_to_builder(&stats, &mut builder, false);
        assert!(builder.get("avgNumMeasurementsPerCommit").is_none());
        assert!(builder.get("numBucketsArchivedDueToTimeForward").is_none());

        stats.num_commits.store(2, std::sync::atomic::Ordering::Relaxed);
        stats
            .num_measurements_committed
            .store(7, std::sync::atomic::Ordering::Relaxed);
        let mut builder = Document::new();
        append_execution_stats_to_builder(&stats, &mut builder, true);
        assert_eq!(builder.get("avgNumMeasurementsPerCommit"), Some(&Value::Int64(3)));
        assert!(builder.get("numBucketsReopened").is_some());
    }
}
