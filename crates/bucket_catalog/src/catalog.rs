//! The bucket catalog: a striped, in-memory coordinator that groups
//! incoming measurements into buckets and serializes their commits.
//!
//! Buckets are spread across independently-lockable stripes to improve
//! parallelism; a bucket maps to a stripe by the hash of its key. A thread
//! holds at most one stripe lock at a time. The catalog-wide state mutex
//! (bucket states and per-namespace stats) may be taken while holding a
//! stripe lock, never the other way around, and no lock is ever held across
//! an await.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    mem::size_of,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        LazyLock,
    },
};

use chrono::{
    DateTime,
    Duration,
    Utc,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use value::{
    heap_size::HeapSize,
    Document,
    Namespace,
    ObjectId,
    StringComparator,
    Value,
    MAX_USER_DOCUMENT_SIZE,
};

use crate::{
    batch::{
        BucketHandle,
        CommitInfo,
        OperationId,
        StripeNumber,
        WriteBatch,
    },
    bucket::{
        generate_bucket_id,
        ArchivedBucket,
        Bucket,
        ClosedBucket,
        ClosedBuckets,
        RolloverAction,
    },
    knobs,
    metadata::{
        BucketKey,
        BucketMetadata,
    },
    minmax::generate_min_max_from_bucket_doc,
    options::{
        compressed_column_element_count,
        is_compressed_bucket,
        TimeseriesOptions,
        BUCKET_CONTROL_FIELD_NAME,
        BUCKET_CONTROL_MIN_FIELD_NAME,
        BUCKET_CONTROL_MAX_FIELD_NAME,
        BUCKET_DATA_FIELD_NAME,
        BUCKET_ID_FIELD_NAME,
    },
    schema::generate_schema_from_bucket_doc,
    state::{
        BucketState,
        BucketStateRegistry,
    },
    stats::{
        append_execution_stats_to_builder,
        ExecutionStats,
        ExecutionStatsController,
    },
};

/// Number of independently-lockable shards. Must be a power of two.
pub const NUMBER_OF_STRIPES: usize = 32;

/// Buckets kept open for large measurements are bounded well below the
/// document size limit, leaving room to add new internal fields to full
/// buckets.
const LARGE_MEASUREMENTS_MAX_BUCKET_SIZE: u64 = (MAX_USER_DOCUMENT_SIZE - 4 * 1024 * 1024) as u64;

/// Limits snapshotted from the knobs when the catalog is built.
#[derive(Clone, Debug)]
pub struct CatalogConfig {
    pub bucket_max_count: u32,
    pub bucket_min_count: u32,
    pub bucket_max_size: u32,
    pub idle_bucket_expiry_memory_usage_threshold: u64,
    pub idle_bucket_expiry_max_count_per_attempt: u32,
    pub scalability_improvements_enabled: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            bucket_max_count: *knobs::TIMESERIES_BUCKET_MAX_COUNT,
            bucket_min_count: *knobs::TIMESERIES_BUCKET_MIN_COUNT,
            bucket_max_size: *knobs::TIMESERIES_BUCKET_MAX_SIZE,
            idle_bucket_expiry_memory_usage_threshold:
                *knobs::TIMESERIES_IDLE_BUCKET_EXPIRY_MEMORY_USAGE_THRESHOLD_BYTES,
            idle_bucket_expiry_max_count_per_attempt:
                *knobs::TIMESERIES_IDLE_BUCKET_EXPIRY_MAX_COUNT_PER_ATTEMPT,
            scalability_improvements_enabled: *knobs::TIMESERIES_SCALABILITY_IMPROVEMENTS_ENABLED,
        }
    }
}

/// Whether an insert may land on a batch shared with other clients'
/// operations, or must stay on a per-operation batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombineWithInsertsFromOtherClients {
    Allow,
    Disallow,
}

fn resolve_op_id(op_id: OperationId, combine: CombineWithInsertsFromOtherClients) -> OperationId {
    match combine {
        CombineWithInsertsFromOtherClients::Allow => 0,
        CombineWithInsertsFromOtherClients::Disallow => {
            assert!(op_id != 0, "operation id required when not combining writes");
            op_id
        },
    }
}

pub struct InsertResult {
    pub batch: Arc<WriteBatch>,
    pub closed_buckets: ClosedBuckets,
}

impl std::fmt::Debug for InsertResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertResult")
            .field("batch", &self.batch.bucket())
            .field("closed_buckets", &self.closed_buckets)
            .finish()
    }
}

/// What `reopen_bucket` needs to know about the collection a persisted
/// bucket belongs to.
pub struct TimeseriesCollection {
    /// The time-series view namespace.
    pub ns: Namespace,
    pub options: Option<TimeseriesOptions>,
    pub collator: Option<Arc<dyn StringComparator>>,
}

#[derive(Default)]
pub(crate) struct Stripe {
    /// All buckets this stripe owns.
    pub all_buckets: HashMap<ObjectId, Bucket>,
    /// The currently open bucket for each series. At most one per key.
    pub open_buckets: HashMap<BucketKey, ObjectId>,
    /// Buckets with no pending writes, ordered by when they went idle.
    /// Smaller entries went idle earlier and are expired first.
    pub idle_buckets: BTreeMap<u64, ObjectId>,
    next_idle_entry: u64,
    /// Archived residue by key hash, then by bucket time window.
    pub archived_buckets: HashMap<u64, BTreeMap<DateTime<Utc>, ArchivedBucket>>,
}

#[derive(Default)]
struct CatalogState {
    bucket_states: BucketStateRegistry,
    execution_stats: HashMap<Namespace, Arc<ExecutionStats>>,
}

pub struct BucketCatalog {
    pub(crate) stripes: Vec<Mutex<Stripe>>,
    /// Approximate total footprint of all live buckets and archived residue.
    /// Authoritative for memory-pressure decisions.
    pub(crate) memory_usage: AtomicU64,
    /// Guards bucket states and the per-namespace stats map.
    state: Mutex<CatalogState>,
    global_execution_stats: Arc<ExecutionStats>,
    pub(crate) config: CatalogConfig,
}

impl Default for BucketCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketCatalog {
    pub fn new() -> Self {
        Self::with_config(CatalogConfig::default())
    }

    pub fn with_config(config: CatalogConfig) -> Self {
        assert!(NUMBER_OF_STRIPES.is_power_of_two());
        Self {
            stripes: (0..NUMBER_OF_STRIPES).map(|_| Mutex::new(Stripe::default())).collect(),
            memory_usage: AtomicU64::new(0),
            state: Mutex::new(CatalogState::default()),
            global_execution_stats: Arc::new(ExecutionStats::default()),
            config,
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Insert a measurement, returning the batch it landed on and any
    /// buckets the insertion closed along the way.
    pub fn insert(
        &self,
        ns: Namespace,
        comparator: Option<Arc<dyn StringComparator>>,
        options: &TimeseriesOptions,
        doc: Document,
        op_id: OperationId,
        combine: CombineWithInsertsFromOtherClients,
    ) -> anyhow::Result<InsertResult> {
        let Some(time) = doc.get_date(&options.time_field) else {
            anyhow::bail!(ErrorMetadata::bad_value(
                "TimeFieldInvalid",
                format!(
                    "'{}' must be present and contain a valid UTC datetime value",
                    options.time_field
                ),
            ));
        };

        let stats = self.get_execution_stats(&ns);

        let metadata_element = options.meta_field.as_ref().and_then(|meta_field| {
            doc.get(meta_field)
                .map(|value| (meta_field.clone(), value.clone()))
        });

        let key = BucketKey::new(ns.clone(), BucketMetadata::new(metadata_element, comparator));
        let stripe_number = stripe_number_for(&key);

        let mut closed_buckets = ClosedBuckets::new();

        let mut stripe_guard = self.stripes[stripe_number].lock();
        let stripe = &mut *stripe_guard;

        let mut bucket_id = self.use_or_create_bucket(
            stripe,
            stripe_number,
            &key,
            time,
            options,
            &stats,
            &mut closed_buckets,
        );

        let bucket = stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("bucket was just resolved under the stripe lock");
        let (mut new_field_names, mut size_to_be_added) =
            bucket.calculate_bucket_fields_and_size_change(&doc, options.meta_field.as_ref());

        if bucket.ns.is_some() {
            let action =
                self.determine_rollover_action(bucket, &doc, time, size_to_be_added, options, &stats);
            if action != RolloverAction::None {
                bucket_id = self.rollover(
                    stripe,
                    stripe_number,
                    bucket_id,
                    action,
                    &key,
                    time,
                    options,
                    &stats,
                    &mut closed_buckets,
                );
                let bucket = stripe
                    .all_buckets
                    .get_mut(&bucket_id)
                    .expect("rollover allocates a replacement bucket");
                (new_field_names, size_to_be_added) =
                    bucket.calculate_bucket_fields_and_size_change(&doc, options.meta_field.as_ref());
            }
        }

        let bucket = stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("bucket was just resolved under the stripe lock");
        let batch = bucket.active_batch(resolve_op_id(op_id, combine), &stats);
        batch.add_measurement(doc.clone());
        bucket.record_new_fields(&batch, new_field_names);

        bucket.num_measurements += 1;
        bucket.size += size_to_be_added as u64;
        if bucket.ns.is_none() {
            // The namespace and metadata only need to be set if this bucket
            // was newly created.
            bucket.ns = Some(ns.clone());
            bucket.metadata = key.metadata.clone();

            // The namespace is stored twice: in the bucket and in the open-
            // bucket index, which also holds a copy of the metadata. The
            // first document's size stands in for the schema tracker, and
            // the two index entries referencing the bucket each carry its
            // id.
            bucket.memory_usage += (ns.len() * 2
                + bucket.metadata.heap_size() * 2
                + doc.serialized_size()
                + size_of::<Bucket>()
                + 2 * size_of::<ObjectId>()) as u64;

            bucket
                .schema
                .update(&doc, options.meta_field.as_ref(), bucket.metadata.comparator());
        } else {
            self.memory_usage.fetch_sub(bucket.memory_usage, Ordering::Relaxed);
        }
        self.memory_usage.fetch_add(bucket.memory_usage, Ordering::Relaxed);

        Ok(InsertResult {
            batch,
            closed_buckets,
        })
    }

    /// Prepare a batch for commit, serializing against any other batch that
    /// is already committing to the same bucket. The caller must hold the
    /// batch's commit rights.
    pub async fn prepare_commit(&self, batch: Arc<WriteBatch>) -> anyhow::Result<()> {
        if batch.finished() {
            // Someone else aborted the batch behind our back. Oops.
            return batch_status(&batch).await;
        }

        self.wait_to_commit_batch(&batch).await;

        enum PrepareOutcome {
            NeedsBatchStatus,
            Ready,
        }

        let bucket_id = batch.bucket().id;
        let outcome = {
            let mut stripe_guard = self.stripes[batch.bucket().stripe].lock();
            let bucket_usable =
                self.use_bucket_in_state(&stripe_guard, bucket_id, BucketState::Prepared);

            if batch.finished() {
                // Someone may have aborted it while we were waiting.
                PrepareOutcome::NeedsBatchStatus
            } else if !bucket_usable {
                let stripe = &mut *stripe_guard;
                let ns = stripe.all_buckets.get(&bucket_id).and_then(|b| b.ns.clone());
                self.abort_batch(stripe, &batch, bucket_cleared_error(&bucket_id, ns.as_ref()));
                PrepareOutcome::NeedsBatchStatus
            } else {
                let stripe = &mut *stripe_guard;
                let bucket = stripe
                    .all_buckets
                    .get_mut(&bucket_id)
                    .expect("usable bucket is present in its stripe");
                let prev_memory_usage = bucket.memory_usage;
                bucket.prepare_batch(&batch);
                self.memory_usage
                    .fetch_add(bucket.memory_usage - prev_memory_usage, Ordering::Relaxed);
                PrepareOutcome::Ready
            }
        };

        match outcome {
            PrepareOutcome::NeedsBatchStatus => batch_status(&batch).await,
            PrepareOutcome::Ready => Ok(()),
        }
    }

    /// Resolve a prepared batch with the outcome of its persisted write.
    /// Returns the bucket if this commit completed a deferred close.
    pub fn finish(&self, batch: Arc<WriteBatch>, info: CommitInfo) -> Option<ClosedBucket> {
        assert!(!batch.finished(), "batch finished more than once");
        batch.finish(info);

        let bucket_id = batch.bucket().id;
        let mut stripe_guard = self.stripes[batch.bucket().stripe].lock();
        let stripe = &mut *stripe_guard;

        let bucket_usable = self.use_bucket_in_state(stripe, bucket_id, BucketState::Normal);
        if bucket_usable {
            stripe
                .all_buckets
                .get_mut(&bucket_id)
                .expect("usable bucket is present in its stripe")
                .prepared_batch = None;
        }

        let stats = batch.stats();
        stats.inc_num_commits();
        if batch.num_previously_committed_measurements() == 0 {
            stats.inc_num_bucket_inserts();
        } else {
            stats.inc_num_bucket_updates();
        }
        let num_measurements = batch.measurements().len() as u32;
        stats.inc_num_measurements_committed(num_measurements as i64);

        if !bucket_usable {
            // The bucket was cleared in between preparing the commit and
            // finishing here. Abort any other ongoing batches and drop the
            // bucket so it's not hanging around idle.
            if stripe.all_buckets.contains_key(&bucket_id) {
                let ns = {
                    let bucket = stripe.all_buckets.get_mut(&bucket_id).expect("checked above");
                    bucket.prepared_batch = None;
                    bucket.ns.clone()
                };
                self.abort_bucket(stripe, bucket_id, None, bucket_cleared_error(&bucket_id, ns.as_ref()));
            }
            return None;
        }

        let bucket = stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("usable bucket is present in its stripe");
        bucket.num_committed_measurements += num_measurements;
        if !bucket.all_committed() {
            return None;
        }
        match bucket.rollover_action {
            RolloverAction::Close => {
                let closed = bucket.closed(false);
                self.remove_bucket(stripe, bucket_id, false);
                Some(closed)
            },
            RolloverAction::Archive => {
                self.archive_bucket(stripe, bucket_id);
                None
            },
            RolloverAction::None => {
                self.mark_bucket_idle(stripe, bucket_id);
                None
            },
        }
    }

    /// Abort a batch. The caller must hold the batch's commit rights.
    pub fn abort(&self, batch: Arc<WriteBatch>, status: ErrorMetadata) {
        assert!(batch.has_commit_rights());
        if batch.finished() {
            return;
        }
        let mut stripe_guard = self.stripes[batch.bucket().stripe].lock();
        self.abort_batch(&mut stripe_guard, &batch, status);
    }

    /// Fold a quantity across all stripes.
    #[cfg(test)]
    pub(crate) fn sum_over_stripes<T: std::iter::Sum>(&self, f: impl Fn(&Stripe) -> T) -> T {
        self.stripes.iter().map(|stripe| f(&stripe.lock())).sum()
    }

    /// Invalidate a bucket after a direct modification of its persisted
    /// form. Fails with a write conflict when the bucket has a prepared
    /// commit in flight; the caller is expected to retry its transaction.
    pub fn clear_bucket(&self, bucket_id: ObjectId) -> anyhow::Result<()> {
        let result = self.set_bucket_state(&bucket_id, BucketState::Cleared);
        if result == Some(BucketState::PreparedAndCleared) {
            anyhow::bail!(ErrorMetadata::write_conflict(format!(
                "Time-series bucket {bucket_id} has a prepared commit in flight"
            )));
        }
        Ok(())
    }

    /// Abort every bucket whose namespace matches, dropping its stats.
    pub fn clear_where(&self, should_clear: impl Fn(&Namespace) -> bool) {
        for stripe_mutex in &self.stripes {
            let mut stripe_guard = stripe_mutex.lock();
            let stripe = &mut *stripe_guard;
            let matching: Vec<(ObjectId, Namespace)> = stripe
                .all_buckets
                .iter()
                .filter_map(|(id, bucket)| {
                    let ns = bucket.ns.as_ref()?;
                    should_clear(ns).then(|| (*id, ns.clone()))
                })
                .collect();
            for (bucket_id, ns) in matching {
                self.state.lock().execution_stats.remove(&ns);
                tracing::debug!(bucket = %bucket_id, ns = %ns, "clearing bucket");
                self.abort_bucket(stripe, bucket_id, None, bucket_cleared_error(&bucket_id, Some(&ns)));
            }
        }
    }

    pub fn clear_namespace(&self, ns: &Namespace) {
        self.clear_where(|bucket_ns| bucket_ns == ns);
    }

    pub fn clear_database(&self, db_name: &str) {
        self.clear_where(|bucket_ns| bucket_ns.db() == db_name);
    }

    /// Register a previously persisted bucket so new measurements can be
    /// appended to it instead of opening a fresh bucket.
    pub fn reopen_bucket(
        &self,
        coll: &TimeseriesCollection,
        bucket_doc: Document,
    ) -> anyhow::Result<()> {
        let ns = &coll.ns;
        let options = coll.options.as_ref().unwrap_or_else(|| {
            panic!("attempting to reopen a bucket for a non-timeseries collection: {ns}")
        });

        let Some(Value::ObjectId(bucket_id)) = bucket_doc.get(BUCKET_ID_FIELD_NAME) else {
            anyhow::bail!(ErrorMetadata::bad_value(
                "InvalidBucketId",
                format!("{BUCKET_ID_FIELD_NAME} is missing or not an ObjectId"),
            ));
        };
        let bucket_id = *bucket_id;
        validate_bucket_doc(&bucket_doc)?;

        let metadata_element = options.meta_field.as_ref().and_then(|meta_field| {
            bucket_doc
                .get(meta_field)
                .map(|value| (meta_field.clone(), value.clone()))
        });
        let key = BucketKey::new(
            ns.clone(),
            BucketMetadata::new(metadata_element, coll.collator.clone()),
        );
        let stripe_number = stripe_number_for(&key);

        let min_time = bucket_doc
            .get_object(BUCKET_CONTROL_FIELD_NAME)
            .and_then(|control| control.get_object(BUCKET_CONTROL_MIN_FIELD_NAME))
            .and_then(|min| min.get_date(&options.time_field))
            .ok_or_else(|| {
                ErrorMetadata::bad_value(
                    "InvalidBucketDocument",
                    format!("control.min.{} must be a UTC datetime", options.time_field),
                )
            })?;

        let mut bucket = Bucket::new(
            bucket_id,
            stripe_number,
            key.hash,
            options.time_field.clone(),
            min_time,
        );
        bucket.ns = Some(ns.clone());
        bucket.metadata = key.metadata.clone();
        bucket.size = bucket_doc.serialized_size() as u64;

        let data = bucket_doc
            .get_object(BUCKET_DATA_FIELD_NAME)
            .expect("validated above");
        for (field_name, _) in data.iter() {
            bucket.field_names.insert(field_name.clone());
        }

        bucket.minmax = generate_min_max_from_bucket_doc(&bucket_doc, coll.collator.as_deref())?;
        bucket.schema = generate_schema_from_bucket_doc(&bucket_doc, coll.collator.as_deref())?;

        let num_measurements = match data.get(&options.time_field) {
            Some(Value::Binary(payload)) if is_compressed_bucket(&bucket_doc) => {
                compressed_column_element_count(payload)?
            },
            Some(Value::Object(times)) => times.len() as u32,
            _ => anyhow::bail!(ErrorMetadata::bad_value(
                "InvalidBucketDocument",
                format!("data.{} column is missing or mistyped", options.time_field),
            )),
        };
        bucket.num_measurements = num_measurements;
        bucket.num_committed_measurements = num_measurements;

        let stats = self.get_execution_stats(ns);
        stats.inc_num_buckets_reopened();

        let mut stripe_guard = self.stripes[stripe_number].lock();
        let stripe = &mut *stripe_guard;
        let mut closed_buckets = ClosedBuckets::new();
        self.expire_idle_buckets(stripe, &stats, &mut closed_buckets);

        let memory = bucket.memory_usage;
        let previous = stripe.all_buckets.insert(bucket_id, bucket);
        assert!(previous.is_none(), "reopened bucket is already in the catalog");
        stripe.open_buckets.insert(key, bucket_id);
        self.state.lock().bucket_states.initialize(bucket_id);
        self.memory_usage.fetch_add(memory, Ordering::Relaxed);

        tracing::debug!(bucket = %bucket_id, ns = %ns, "reopened bucket");
        Ok(())
    }

    /// The metadata of the bucket, or an empty document if it is gone.
    pub fn get_metadata(&self, handle: &BucketHandle) -> Document {
        let stripe = self.stripes[handle.stripe].lock();
        if !self.bucket_still_usable(&stripe, handle.id) {
            return Document::new();
        }
        stripe.all_buckets[&handle.id].metadata.to_doc()
    }

    pub fn append_execution_stats(&self, ns: &Namespace, builder: &mut Document) {
        static EMPTY_STATS: LazyLock<Arc<ExecutionStats>> = LazyLock::new(Default::default);
        let stats = self
            .state
            .lock()
            .execution_stats
            .get(ns)
            .cloned()
            .unwrap_or_else(|| EMPTY_STATS.clone());
        append_execution_stats_to_builder(
            &stats,
            builder,
            self.config.scalability_improvements_enabled,
        );
    }

    pub fn append_global_execution_stats(&self, builder: &mut Document) {
        append_execution_stats_to_builder(
            &self.global_execution_stats,
            builder,
            self.config.scalability_improvements_enabled,
        );
    }

    /// Aggregate counts for server status, empty when the catalog has never
    /// been used.
    pub fn server_status(&self) -> Document {
        if self.state.lock().execution_stats.is_empty() {
            return Document::new();
        }

        let (mut all, mut open, mut idle) = (0usize, 0usize, 0usize);
        for stripe_mutex in &self.stripes {
            let stripe = stripe_mutex.lock();
            all += stripe.all_buckets.len();
            open += stripe.open_buckets.len();
            idle += stripe.idle_buckets.len();
        }

        let mut builder = Document::new();
        let mut append = |name: &str, v: i64| {
            builder.append(name.parse().expect("static field name"), v);
        };
        append("numBuckets", all as i64);
        append("numOpenBuckets", open as i64);
        append("numIdleBuckets", idle as i64);
        append("memoryUsage", self.memory_usage() as i64);
        self.append_global_execution_stats(&mut builder);
        builder
    }

    fn get_execution_stats(&self, ns: &Namespace) -> ExecutionStatsController {
        let mut state = self.state.lock();
        let collection_stats = state.execution_stats.entry(ns.clone()).or_default().clone();
        ExecutionStatsController::new(collection_stats, self.global_execution_stats.clone())
    }

    fn get_bucket_state(&self, bucket_id: &ObjectId) -> Option<BucketState> {
        self.state.lock().bucket_states.get(bucket_id)
    }

    fn set_bucket_state(&self, bucket_id: &ObjectId, target: BucketState) -> Option<BucketState> {
        self.state.lock().bucket_states.set(bucket_id, target)
    }

    /// Whether the bucket is present and not cleared.
    fn bucket_still_usable(&self, stripe: &Stripe, bucket_id: ObjectId) -> bool {
        stripe.all_buckets.contains_key(&bucket_id)
            && self
                .get_bucket_state(&bucket_id)
                .is_some_and(|state| !state.conflicts_with_insertion())
    }

    /// Apply a state transition to the bucket and report whether it came out
    /// usable. Missing buckets are never usable.
    fn use_bucket_in_state(
        &self,
        stripe: &Stripe,
        bucket_id: ObjectId,
        target: BucketState,
    ) -> bool {
        if !stripe.all_buckets.contains_key(&bucket_id) {
            return false;
        }
        matches!(
            self.set_bucket_state(&bucket_id, target),
            Some(state) if !state.conflicts_with_insertion()
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn use_or_create_bucket(
        &self,
        stripe: &mut Stripe,
        stripe_number: StripeNumber,
        key: &BucketKey,
        time: DateTime<Utc>,
        options: &TimeseriesOptions,
        stats: &ExecutionStatsController,
        closed_buckets: &mut ClosedBuckets,
    ) -> ObjectId {
        let Some(&bucket_id) = stripe.open_buckets.get(key) else {
            // No open bucket for this metadata.
            return self.allocate_bucket(
                stripe,
                stripe_number,
                key,
                time,
                options,
                stats,
                closed_buckets,
                true,
            );
        };

        let state = self.get_bucket_state(&bucket_id);
        if matches!(state, Some(BucketState::Normal) | Some(BucketState::Prepared)) {
            self.mark_bucket_not_idle(stripe, bucket_id);
            return bucket_id;
        }

        let ns = stripe.all_buckets[&bucket_id].ns.clone();
        self.abort_bucket(stripe, bucket_id, None, bucket_cleared_error(&bucket_id, ns.as_ref()));
        self.allocate_bucket(
            stripe,
            stripe_number,
            key,
            time,
            options,
            stats,
            closed_buckets,
            true,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_bucket(
        &self,
        stripe: &mut Stripe,
        stripe_number: StripeNumber,
        key: &BucketKey,
        time: DateTime<Utc>,
        options: &TimeseriesOptions,
        stats: &ExecutionStatsController,
        closed_buckets: &mut ClosedBuckets,
        opened_due_to_metadata: bool,
    ) -> ObjectId {
        self.expire_idle_buckets(stripe, stats, closed_buckets);

        let (bucket_id, rounded_time) = generate_bucket_id(time, options);
        let mut bucket = Bucket::new(
            bucket_id,
            stripe_number,
            key.hash,
            options.time_field.clone(),
            rounded_time,
        );

        // Seed the summaries so that control.min's time field tracks the
        // rounded window start rather than the first measurement's time.
        let mut control_doc = Document::new();
        control_doc.append(options.time_field.clone(), rounded_time);
        bucket.minmax.update(&control_doc, None, bucket.metadata.comparator());

        let previous = stripe.all_buckets.insert(bucket_id, bucket);
        assert!(previous.is_none(), "bucket id collision within one process");
        stripe.open_buckets.insert(key.clone(), bucket_id);
        self.state.lock().bucket_states.initialize(bucket_id);

        if opened_due_to_metadata {
            stats.inc_num_buckets_opened_due_to_metadata();
        }
        bucket_id
    }

    fn determine_rollover_action(
        &self,
        bucket: &mut Bucket,
        doc: &Document,
        time: DateTime<Utc>,
        size_to_be_added: u32,
        options: &TimeseriesOptions,
        stats: &ExecutionStatsController,
    ) -> RolloverAction {
        let can_archive = self.config.scalability_improvements_enabled;

        if bucket.schema_incompatible(doc) {
            stats.inc_num_buckets_closed_due_to_schema_change();
            return RolloverAction::Close;
        }
        if bucket.num_measurements == self.config.bucket_max_count {
            stats.inc_num_buckets_closed_due_to_count();
            return RolloverAction::Close;
        }
        let bucket_time = bucket.min_time;
        if time - bucket_time >= Duration::seconds(options.bucket_max_span_seconds as i64) {
            if can_archive {
                stats.inc_num_buckets_archived_due_to_time_forward();
                return RolloverAction::Archive;
            }
            stats.inc_num_buckets_closed_due_to_time_forward();
            return RolloverAction::Close;
        }
        if time < bucket_time {
            if can_archive {
                stats.inc_num_buckets_archived_due_to_time_backward();
                return RolloverAction::Archive;
            }
            stats.inc_num_buckets_closed_due_to_time_backward();
            return RolloverAction::Close;
        }
        if bucket.size + size_to_be_added as u64 > self.config.bucket_max_size as u64 {
            let keep_open =
                can_archive && bucket.num_measurements < self.config.bucket_min_count;
            if !keep_open {
                stats.inc_num_buckets_closed_due_to_size();
                return RolloverAction::Close;
            }
            if bucket.size + size_to_be_added as u64 > LARGE_MEASUREMENTS_MAX_BUCKET_SIZE {
                stats.inc_num_buckets_closed_due_to_size();
                return RolloverAction::Close;
            }
            // There's enough space for this measurement and the bucket is
            // still below the large-measurement bound.
            if !bucket.kept_open_due_to_large_measurements {
                // Only count this once per bucket.
                bucket.kept_open_due_to_large_measurements = true;
                stats.inc_num_buckets_kept_open_due_to_large_measurements();
            }
            return RolloverAction::None;
        }
        RolloverAction::None
    }

    #[allow(clippy::too_many_arguments)]
    fn rollover(
        &self,
        stripe: &mut Stripe,
        stripe_number: StripeNumber,
        bucket_id: ObjectId,
        action: RolloverAction,
        key: &BucketKey,
        time: DateTime<Utc>,
        options: &TimeseriesOptions,
        stats: &ExecutionStatsController,
        closed_buckets: &mut ClosedBuckets,
    ) -> ObjectId {
        assert_ne!(action, RolloverAction::None);
        let bucket = stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("rolling over a bucket that is not in its stripe");
        if bucket.all_committed() {
            // Nothing pending; take the action now.
            match action {
                RolloverAction::Close => {
                    closed_buckets.push(bucket.closed(false));
                    self.remove_bucket(stripe, bucket_id, false);
                },
                RolloverAction::Archive => self.archive_bucket(stripe, bucket_id),
                RolloverAction::None => unreachable!(),
            }
        } else {
            // The bucket must stay around until its batches commit; finish
            // applies the action when the last one does.
            bucket.rollover_action = action;
        }

        self.allocate_bucket(
            stripe,
            stripe_number,
            key,
            time,
            options,
            stats,
            closed_buckets,
            false,
        )
    }

    fn remove_bucket(&self, stripe: &mut Stripe, bucket_id: ObjectId, archiving: bool) {
        let bucket = stripe
            .all_buckets
            .remove(&bucket_id)
            .expect("removing a bucket that is not in its stripe");
        assert!(bucket.batches.is_empty());
        assert!(bucket.prepared_batch.is_none());

        self.memory_usage.fetch_sub(bucket.memory_usage, Ordering::Relaxed);
        if let Some(entry) = bucket.idle_list_entry {
            stripe.idle_buckets.remove(&entry);
        }

        // The bucket may have been rolled over, in which case a different
        // open bucket holds this key now.
        if let Some(ns) = bucket.ns {
            let key = BucketKey::from_parts(ns, bucket.metadata, bucket.key_hash);
            if stripe.open_buckets.get(&key) == Some(&bucket_id) {
                stripe.open_buckets.remove(&key);
            }
        }

        // Archival preserves the state entry so a cleared id cannot be
        // resurrected by a reopen; otherwise drop it with the bucket.
        if !archiving {
            self.state.lock().bucket_states.erase(&bucket_id);
        }
    }

    fn archive_bucket(&self, stripe: &mut Stripe, bucket_id: ObjectId) {
        let bucket = &stripe.all_buckets[&bucket_id];
        let key_hash = bucket.key_hash;
        let bucket_time = bucket.min_time;
        let archived = ArchivedBucket {
            bucket_id,
            time_field: bucket.time_field.clone(),
            num_measurements: bucket.num_measurements,
        };

        let archived_set = stripe.archived_buckets.entry(key_hash).or_default();
        let mut did_archive = false;
        if !archived_set.contains_key(&bucket_time) {
            let memory =
                marginal_memory_usage_for_archived_bucket(&archived, archived_set.is_empty());
            archived_set.insert(bucket_time, archived);
            self.memory_usage.fetch_add(memory, Ordering::Relaxed);
            did_archive = true;
        }
        self.remove_bucket(stripe, bucket_id, did_archive);
    }

    /// Abort a batch when its bucket may already be gone.
    fn abort_batch(&self, stripe: &mut Stripe, batch: &Arc<WriteBatch>, status: ErrorMetadata) {
        if !stripe.all_buckets.contains_key(&batch.bucket().id) {
            // The bucket has already been cleared; only this batch needs the
            // bad news.
            batch.abort(status);
            return;
        }
        self.abort_bucket(stripe, batch.bucket().id, Some(batch), status);
    }

    /// Abort every unprepared batch on the bucket, and remove the bucket
    /// unless someone else's prepared batch is still in flight.
    fn abort_bucket(
        &self,
        stripe: &mut Stripe,
        bucket_id: ObjectId,
        batch: Option<&Arc<WriteBatch>>,
        status: ErrorMetadata,
    ) {
        let bucket = stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("aborting a bucket that is not in its stripe");
        // Safe under the stripe lock: nobody else can reach these batches.
        for (_, current) in bucket.batches.drain() {
            current.abort(status.clone());
        }

        let mut do_remove = true;
        if let Some(prepared) = bucket.prepared_batch.clone() {
            match batch {
                Some(batch) if Arc::ptr_eq(&prepared, batch) => {
                    // We own the prepared batch, so it can be aborted and the
                    // bucket removed with it.
                    prepared.abort(status);
                    bucket.prepared_batch = None;
                },
                // Someone else's prepared batch is outstanding; whatever its
                // owner is doing with it, the bucket must stay until that
                // batch finishes.
                _ => do_remove = false,
            }
        }
        if do_remove {
            self.remove_bucket(stripe, bucket_id, false);
        }
    }

    /// Serialize against any batch already committing to the bucket: either
    /// install this batch as the bucket's prepared batch, or wait for the
    /// current one to finish and try again. Returns without installing when
    /// the bucket is gone or the batch was aborted while waiting.
    async fn wait_to_commit_batch(&self, batch: &Arc<WriteBatch>) {
        loop {
            let current = {
                let mut stripe_guard = self.stripes[batch.bucket().stripe].lock();
                let stripe = &mut *stripe_guard;
                if !self.bucket_still_usable(stripe, batch.bucket().id) || batch.finished() {
                    return;
                }
                let bucket = stripe
                    .all_buckets
                    .get_mut(&batch.bucket().id)
                    .expect("usable bucket is present in its stripe");
                match bucket.prepared_batch.clone() {
                    None => {
                        // No other batch for this bucket is currently
                        // committing, so we can proceed.
                        bucket.prepared_batch = Some(batch.clone());
                        bucket.batches.remove(&batch.op_id());
                        return;
                    },
                    Some(current) => current,
                }
            };
            // We have to wait for someone else to finish; the outcome
            // doesn't matter.
            let _ = current.get_result().await;
        }
    }

    fn mark_bucket_idle(&self, stripe: &mut Stripe, bucket_id: ObjectId) {
        let entry = stripe.next_idle_entry;
        stripe.next_idle_entry += 1;
        stripe.idle_buckets.insert(entry, bucket_id);
        stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("marking a bucket that is not in its stripe")
            .idle_list_entry = Some(entry);
    }

    fn mark_bucket_not_idle(&self, stripe: &mut Stripe, bucket_id: ObjectId) {
        let bucket = stripe
            .all_buckets
            .get_mut(&bucket_id)
            .expect("marking a bucket that is not in its stripe");
        if let Some(entry) = bucket.idle_list_entry.take() {
            stripe.idle_buckets.remove(&entry);
        }
    }

    /// Reclaim memory under pressure: close or archive idle buckets first,
    /// then drop archived residue, within a bounded number of evictions.
    fn expire_idle_buckets(
        &self,
        stripe: &mut Stripe,
        stats: &ExecutionStatsController,
        closed_buckets: &mut ClosedBuckets,
    ) {
        let mut num_expired: u32 = 0;
        let can_archive = self.config.scalability_improvements_enabled;
        let threshold = self.config.idle_bucket_expiry_memory_usage_threshold;
        let max_per_attempt = self.config.idle_bucket_expiry_max_count_per_attempt;

        while self.memory_usage() > threshold && num_expired <= max_per_attempt {
            let Some((_, &bucket_id)) = stripe.idle_buckets.first_key_value() else {
                break;
            };
            if can_archive {
                tracing::debug!(bucket = %bucket_id, "archiving idle bucket under memory pressure");
                self.archive_bucket(stripe, bucket_id);
                stats.inc_num_buckets_archived_due_to_memory_threshold();
            } else {
                tracing::debug!(bucket = %bucket_id, "closing idle bucket under memory pressure");
                let closed = stripe.all_buckets[&bucket_id].closed(false);
                self.remove_bucket(stripe, bucket_id, false);
                stats.inc_num_buckets_closed_due_to_memory_threshold();
                closed_buckets.push(closed);
            }
            num_expired += 1;
        }

        while can_archive && self.memory_usage() > threshold && num_expired <= max_per_attempt {
            // Drop the oldest window of whichever series comes up first.
            let Some((key_hash, bucket_time, closed, memory)) = ({
                stripe.archived_buckets.iter().next().map(|(&key_hash, archived_set)| {
                    let (&bucket_time, archived) = archived_set
                        .iter()
                        .next()
                        .expect("archived sets are never left empty");
                    let closed = ClosedBucket {
                        bucket_id: archived.bucket_id,
                        time_field: archived.time_field.clone(),
                        num_measurements: archived.num_measurements,
                        eligible_for_reopening: true,
                    };
                    let memory = marginal_memory_usage_for_archived_bucket(
                        archived,
                        archived_set.len() == 1,
                    );
                    (key_hash, bucket_time, closed, memory)
                })
            }) else {
                break;
            };

            self.state.lock().bucket_states.erase(&closed.bucket_id);
            let archived_set = stripe
                .archived_buckets
                .get_mut(&key_hash)
                .expect("set observed above");
            archived_set.remove(&bucket_time);
            if archived_set.is_empty() {
                // Don't leave an empty set behind for this key hash.
                stripe.archived_buckets.remove(&key_hash);
            }
            self.memory_usage.fetch_sub(memory, Ordering::Relaxed);

            tracing::debug!(bucket = %closed.bucket_id, "dropping archived bucket under memory pressure");
            stats.inc_num_buckets_closed_due_to_memory_threshold();
            closed_buckets.push(closed);
            num_expired += 1;
        }
    }
}

fn stripe_number_for(key: &BucketKey) -> StripeNumber {
    (key.hash % NUMBER_OF_STRIPES as u64) as StripeNumber
}

fn bucket_cleared_error(bucket_id: &ObjectId, ns: Option<&Namespace>) -> ErrorMetadata {
    let ns_identification = ns.map(|ns| format!(" for namespace {ns}")).unwrap_or_default();
    ErrorMetadata::bucket_cleared(format!(
        "Time-series bucket {bucket_id}{ns_identification} was cleared"
    ))
}

async fn batch_status(batch: &WriteBatch) -> anyhow::Result<()> {
    batch.get_result().await.map(|_| ())
}

fn validate_bucket_doc(bucket_doc: &Document) -> anyhow::Result<()> {
    let control = bucket_doc.get_object(BUCKET_CONTROL_FIELD_NAME);
    let well_formed = control.is_some_and(|control| {
        control.get_object(BUCKET_CONTROL_MIN_FIELD_NAME).is_some()
            && control.get_object(BUCKET_CONTROL_MAX_FIELD_NAME).is_some()
    }) && bucket_doc.get_object(BUCKET_DATA_FIELD_NAME).is_some();
    if !well_formed {
        anyhow::bail!(ErrorMetadata::bad_value(
            "InvalidBucketDocument",
            "bucket document is missing its control or data blocks",
        ));
    }
    Ok(())
}

fn marginal_memory_usage_for_archived_bucket(
    bucket: &ArchivedBucket,
    only_entry_for_matching_meta_hash: bool,
) -> u64 {
    (size_of::<u64>()
        + size_of::<DateTime<Utc>>()
        + size_of::<ArchivedBucket>()
        + bucket.time_field.len()
        + if only_entry_for_matching_meta_hash {
            size_of::<BTreeMap<DateTime<Utc>, ArchivedBucket>>()
        } else {
            0
        }) as u64
}
