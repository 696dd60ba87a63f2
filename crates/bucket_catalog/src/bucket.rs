//! The unit of aggregation: one open bucket's in-memory state.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    mem::size_of,
    sync::Arc,
};

use chrono::{
    DateTime,
    Utc,
};
use value::{
    Document,
    FieldName,
    Namespace,
    ObjectId,
};

use crate::{
    batch::{
        BucketHandle,
        OperationId,
        StripeNumber,
        WriteBatch,
    },
    metadata::BucketMetadata,
    minmax::MinMax,
    options::{
        round_timestamp_to_granularity,
        TimeseriesOptions,
    },
    schema::{
        Schema,
        UpdateStatus,
    },
    stats::ExecutionStatsController,
};

/// Serialized size of `{"": {}}`: an element frame with an empty name around
/// an empty object. Offset for charging real field names below.
const EMPTY_OBJ_SIZE: usize = 12;

pub(crate) fn num_digits(mut num: u32) -> u32 {
    let mut digits = 0;
    while num != 0 {
        num /= 10;
        digits += 1;
    }
    digits
}

/// Synthesize an id for a new bucket covering `time`.
///
/// The id's timestamp field is the measurement time rounded down to the
/// granularity boundary, so a measurement's bucket window is predictable
/// from its timestamp alone. Rounding alone would concentrate every bucket
/// of a window onto the same timestamp prefix, so the difference between
/// the actual and rounded time is folded into the id's instance bytes to
/// spread ids generated in one window. Ids from different processes within
/// one window can still collide; callers must not assume uniqueness.
pub(crate) fn generate_bucket_id(
    time: DateTime<Utc>,
    options: &TimeseriesOptions,
) -> (ObjectId, DateTime<Utc>) {
    let mut bucket_id = ObjectId::generate();
    let rounded_time = round_timestamp_to_granularity(time, options.granularity);
    bucket_id.set_timestamp(rounded_time.timestamp() as u32);
    bucket_id.perturb_instance((time.timestamp() - rounded_time.timestamp()) as u32);
    (bucket_id, rounded_time)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RolloverAction {
    None,
    Archive,
    Close,
}

/// A bucket the catalog has handed back to the caller, ready to be flushed
/// or compacted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosedBucket {
    pub bucket_id: ObjectId,
    pub time_field: FieldName,
    pub num_measurements: u32,
    pub eligible_for_reopening: bool,
}

pub type ClosedBuckets = Vec<ClosedBucket>;

/// Residue of an archived bucket: enough to route a reopen and report what
/// was evicted, at a tiny fraction of the open bucket's footprint.
#[derive(Clone, Debug)]
pub(crate) struct ArchivedBucket {
    pub bucket_id: ObjectId,
    pub time_field: FieldName,
    pub num_measurements: u32,
}

pub(crate) struct Bucket {
    pub id: ObjectId,
    /// The stripe which owns this bucket. Immutable after construction.
    pub stripe: StripeNumber,
    /// The pre-computed hash of the associated BucketKey.
    pub key_hash: u64,
    /// Set on the first insert; `None` marks a freshly allocated bucket.
    pub ns: Option<Namespace>,
    pub metadata: BucketMetadata,
    /// Top-level field names of committed measurements.
    pub field_names: HashSet<FieldName>,
    /// Top-level new field names that have not been committed yet.
    pub uncommitted_field_names: HashSet<FieldName>,
    pub time_field: FieldName,
    /// Start of the bucket's rounded time window.
    pub min_time: DateTime<Utc>,
    pub minmax: MinMax,
    /// May reflect the schema of uncommitted measurements.
    pub schema: Schema,
    /// Total serialized size of the bucket, including measurements that are
    /// only pending.
    pub size: u64,
    /// Total number of measurements, including uncommitted ones.
    pub num_measurements: u32,
    pub num_committed_measurements: u32,
    pub rollover_action: RolloverAction,
    /// Latches once per bucket; see the size rollover policy.
    pub kept_open_due_to_large_measurements: bool,
    /// The batch currently being committed, if any. At most one at a time.
    pub prepared_batch: Option<Arc<WriteBatch>>,
    /// Uncommitted batches by operation.
    pub batches: HashMap<OperationId, Arc<WriteBatch>>,
    /// Position in the stripe's idle list, when idle.
    pub idle_list_entry: Option<u64>,
    /// Approximate memory footprint, maintained incrementally.
    pub memory_usage: u64,
}

impl Bucket {
    pub fn new(
        id: ObjectId,
        stripe: StripeNumber,
        key_hash: u64,
        time_field: FieldName,
        min_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            stripe,
            key_hash,
            ns: None,
            metadata: BucketMetadata::default(),
            field_names: HashSet::new(),
            uncommitted_field_names: HashSet::new(),
            time_field,
            min_time,
            minmax: MinMax::default(),
            schema: Schema::default(),
            size: 0,
            num_measurements: 0,
            num_committed_measurements: 0,
            rollover_action: RolloverAction::None,
            kept_open_due_to_large_measurements: false,
            prepared_batch: None,
            batches: HashMap::new(),
            idle_list_entry: None,
            memory_usage: size_of::<Bucket>() as u64,
        }
    }

    pub fn handle(&self) -> BucketHandle {
        BucketHandle {
            id: self.id,
            stripe: self.stripe,
        }
    }

    /// Whether every measurement in the bucket has been committed.
    pub fn all_committed(&self) -> bool {
        self.batches.is_empty() && self.prepared_batch.is_none()
    }

    pub fn closed(&self, eligible_for_reopening: bool) -> ClosedBucket {
        ClosedBucket {
            bucket_id: self.id,
            time_field: self.time_field.clone(),
            num_measurements: self.num_measurements,
            eligible_for_reopening,
        }
    }

    /// Whether `doc`'s schema conflicts with the measurements already in the
    /// bucket. A compatible document is absorbed into the reference schema.
    pub fn schema_incompatible(&mut self, doc: &Document) -> bool {
        let meta_field = self.metadata.meta_field().cloned();
        self.schema
            .update(doc, meta_field.as_ref(), self.metadata.comparator())
            == UpdateStatus::Failed
    }

    /// Determine the effect of adding `doc` to this bucket: which top-level
    /// field names would be new, and how much the serialized size grows.
    ///
    /// A new field name is charged for an empty sub-object plus two copies of
    /// the element, reserving room in both the min and max summaries (the
    /// first measurement of a field is both). Every element is additionally
    /// charged at its positional name inside the bucket's data column: the
    /// field name is replaced by the measurement's ordinal, whose stringified
    /// form has no nul terminator.
    pub fn calculate_bucket_fields_and_size_change(
        &self,
        doc: &Document,
        meta_field: Option<&FieldName>,
    ) -> (Vec<FieldName>, u32) {
        let mut new_field_names = Vec::new();
        let mut size_to_be_added = 0usize;
        let num_measurements_field_length = num_digits(self.num_measurements) as usize;
        for (field_name, value) in doc.iter() {
            if Some(field_name) == meta_field {
                // The metadata field is not inserted into the data columns.
                continue;
            }

            if !self.field_names.contains(field_name) {
                // Record the new field name only if it hasn't been committed
                // yet. There could be concurrent batches writing to this
                // bucket with the same new field name, but they're not
                // guaranteed to commit successfully.
                new_field_names.push(field_name.clone());

                // Only update the bucket size once to account for the new
                // field name if it isn't already pending a commit from
                // another batch.
                if !self.uncommitted_field_names.contains(field_name) {
                    size_to_be_added += EMPTY_OBJ_SIZE + field_name.len();
                    size_to_be_added += value.element_size(field_name) * 2;
                }
            }

            size_to_be_added += value.element_size(field_name) - (field_name.len() + 1)
                + num_measurements_field_length
                + 1;
        }
        (new_field_names, size_to_be_added as u32)
    }

    /// Return the open batch for the operation, creating it if necessary.
    pub fn active_batch(
        &mut self,
        op_id: OperationId,
        stats: &ExecutionStatsController,
    ) -> Arc<WriteBatch> {
        if let Some(batch) = self.batches.get(&op_id) {
            return batch.clone();
        }
        let batch = WriteBatch::new(self.handle(), op_id, stats.clone());
        self.batches.insert(op_id, batch.clone());
        batch
    }

    /// Record `fields` as pending inserts for `batch`.
    pub fn record_new_fields(&mut self, batch: &WriteBatch, fields: Vec<FieldName>) {
        let mut inner = batch.lock_inner();
        for field in fields {
            self.uncommitted_field_names.insert(field.clone());
            inner.new_field_names.insert(field);
        }
    }

    /// Fold a prepared batch into the bucket's committed state: settle its
    /// pending field names against what has committed in the meantime, fold
    /// its measurements into the min/max summaries, and snapshot the summary
    /// (or its delta, for an update) into the batch.
    pub fn prepare_batch(&mut self, batch: &WriteBatch) {
        assert!(batch.has_commit_rights());
        let mut inner = batch.lock_inner();
        inner.num_previously_committed = self.num_committed_measurements;

        // Filter out field names that were new at the time of insertion, but
        // have since been committed by someone else.
        let field_names = &mut self.field_names;
        let uncommitted_field_names = &mut self.uncommitted_field_names;
        inner.new_field_names.retain(|field| {
            uncommitted_field_names.remove(field);
            if field_names.contains(field) {
                return false;
            }
            field_names.insert(field.clone());
            true
        });

        let meta_field = self.metadata.meta_field().cloned();
        for doc in &inner.measurements {
            self.minmax
                .update(doc, meta_field.as_ref(), self.metadata.comparator());
        }

        let is_update = inner.num_previously_committed > 0;
        if is_update {
            inner.min = self.minmax.min_updates();
            inner.max = self.minmax.max_updates();
        } else {
            inner.min = self.minmax.min();
            inner.max = self.minmax.max();

            // Approximate the summaries' footprint by the initial commit's
            // sizes. Later commits may add fields but mostly change values.
            self.memory_usage += (inner.min.serialized_size() + inner.max.serialized_size()) as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use value::{
        date_from_millis,
        doc,
        FieldName,
        ObjectId,
    };

    use super::{
        generate_bucket_id,
        num_digits,
        Bucket,
    };
    use crate::options::TimeseriesOptions;

    fn time_field() -> FieldName {
        "t".parse().unwrap()
    }

    fn test_bucket() -> Bucket {
        Bucket::new(
            ObjectId::generate(),
            0,
            0,
            time_field(),
            date_from_millis(60_000),
        )
    }

    #[test]
    fn test_num_digits() {
        assert_eq!(num_digits(0), 0);
        assert_eq!(num_digits(9), 1);
        assert_eq!(num_digits(10), 2);
        assert_eq!(num_digits(999), 3);
        assert_eq!(num_digits(1000), 4);
    }

    #[test]
    fn test_bucket_id_timestamp_is_rounded() {
        let options = TimeseriesOptions::new(time_field());
        let (id, rounded) = generate_bucket_id(date_from_millis(119_500), &options);
        assert_eq!(id.timestamp(), 60);
        assert_eq!(rounded, date_from_millis(60_000));
    }

    #[test]
    fn test_bucket_ids_in_one_window_differ() {
        let options = TimeseriesOptions::new(time_field());
        let (a, _) = generate_bucket_id(date_from_millis(60_000), &options);
        let (b, _) = generate_bucket_id(date_from_millis(61_000), &options);
        assert_eq!(a.timestamp(), b.timestamp());
        assert_ne!(a, b);
    }

    #[test]
    fn test_size_change_charges_new_fields_once() {
        let mut bucket = test_bucket();
        let doc = doc! { "t" => date_from_millis(60_000), "x" => 1i64 };

        let (new_fields, first_charge) =
            bucket.calculate_bucket_fields_and_size_change(&doc, None);
        assert_eq!(new_fields.len(), 2);
        // New fields pay the summary reservation: an element for t or x is
        // 11 bytes, so each new field adds 12 + 1 + 22 on top of its column
        // charge of 11 - 2 + 0 + 1.
        assert_eq!(first_charge, 90);

        for field in new_fields {
            bucket.field_names.insert(field);
        }
        bucket.num_measurements = 1;

        let (new_fields, second_charge) =
            bucket.calculate_bucket_fields_and_size_change(&doc, None);
        assert!(new_fields.is_empty());
        // Only the positional column charge remains, now one digit wider.
        assert_eq!(second_charge, 22);
    }

    #[test]
    fn test_size_change_skips_meta_field() {
        let bucket = test_bucket();
        let meta: FieldName = "m".parse().unwrap();
        let with_meta = doc! { "t" => date_from_millis(60_000), "m" => "a" };
        let without_meta = doc! { "t" => date_from_millis(60_000) };

        let (_, with_charge) =
            bucket.calculate_bucket_fields_and_size_change(&with_meta, Some(&meta));
        let (_, without_charge) =
            bucket.calculate_bucket_fields_and_size_change(&without_meta, None);
        assert_eq!(with_charge, without_charge);
    }

    #[test]
    fn test_uncommitted_fields_not_double_charged() {
        let mut bucket = test_bucket();
        let doc = doc! { "x" => 1i64 };

        let (new_fields, first) = bucket.calculate_bucket_fields_and_size_change(&doc, None);
        for field in new_fields {
            bucket.uncommitted_field_names.insert(field);
        }
        let (new_fields, second) = bucket.calculate_bucket_fields_and_size_change(&doc, None);
        // Still reported as new (another batch may fail to commit it), but
        // the summary reservation is only charged once.
        assert_eq!(new_fields.len(), 1);
        assert!(second < first);
    }
}
